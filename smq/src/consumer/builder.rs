use std::marker::PhantomData;

use redis::Client;

use crate::{
    config::SmqConfig,
    consumer::{Consumer, ConsumerOptions},
    error::SmqError,
    store::RedisStore,
};

// Typestate markers for tracking builder state
pub struct NoRedis;
pub struct HasRedis;

enum RedisSource {
    Url(String),
    Client(Client),
    Store(RedisStore),
}

pub struct ConsumerBuilder<R> {
    redis_source: Option<RedisSource>,
    options: Option<ConsumerOptions>,
    _phantom: PhantomData<R>,
}

impl Default for ConsumerBuilder<NoRedis> {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerBuilder<NoRedis> {
    pub fn new() -> Self {
        Self {
            redis_source: None,
            options: None,
            _phantom: PhantomData,
        }
    }

    /// Redis url and message storage taken from a loaded configuration.
    pub fn from_config(config: &SmqConfig) -> ConsumerBuilder<HasRedis> {
        Self::new()
            .redis_url(config.redis.url.clone())
            .options(ConsumerOptions {
                messages: config.messages.clone(),
                ..Default::default()
            })
    }

    pub fn redis_url<S: Into<String>>(self, url: S) -> ConsumerBuilder<HasRedis> {
        self.with_source(RedisSource::Url(url.into()))
    }

    pub fn redis_client(self, client: Client) -> ConsumerBuilder<HasRedis> {
        self.with_source(RedisSource::Client(client))
    }

    /// Share an already connected store, and its scripts, with other components.
    pub fn store(self, store: RedisStore) -> ConsumerBuilder<HasRedis> {
        self.with_source(RedisSource::Store(store))
    }

    fn with_source(self, source: RedisSource) -> ConsumerBuilder<HasRedis> {
        ConsumerBuilder {
            redis_source: Some(source),
            options: self.options,
            _phantom: PhantomData,
        }
    }
}

// Options can be set at any time (it's optional)
impl<R> ConsumerBuilder<R> {
    pub fn options(self, options: ConsumerOptions) -> Self {
        Self {
            redis_source: self.redis_source,
            options: Some(options),
            _phantom: PhantomData,
        }
    }
}

impl ConsumerBuilder<HasRedis> {
    pub async fn build(self) -> Result<Consumer, SmqError> {
        let store = match self.redis_source {
            Some(RedisSource::Url(url)) => RedisStore::connect(&url).await?,
            Some(RedisSource::Client(client)) => RedisStore::from_client(client).await?,
            Some(RedisSource::Store(store)) => store,
            None => return Err(SmqError::runtime("consumer builder has no redis source")),
        };
        Consumer::new(store, self.options.unwrap_or_default())
    }
}

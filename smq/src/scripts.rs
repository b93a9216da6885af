use redis::Script;

/// Lua scripts used for every multi-key transition. Built once per store and
/// shared; `redis::Script` loads by SHA on first use.
pub struct Scripts {
    pub create_queue: Script,
    pub publish_message: Script,
    pub init_consumer_queue: Script,
    pub unregister_consumer_queue: Script,
    pub list_move: Script,
    pub dequeue_priority: Script,
    pub fetch_for_processing: Script,
    pub check_rate_limit: Script,
    pub acknowledge_message: Script,
    pub unacknowledge_messages: Script,
    pub release_delayed_and_requeued: Script,
    pub fire_scheduled_message: Script,
    pub fire_periodic_message: Script,
    pub set_queue_state: Script,
    pub release_lock: Script,
    pub extend_lock: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            create_queue: Script::new(CREATE_QUEUE),
            publish_message: Script::new(PUBLISH_MESSAGE),
            init_consumer_queue: Script::new(INIT_CONSUMER_QUEUE),
            unregister_consumer_queue: Script::new(UNREGISTER_CONSUMER_QUEUE),
            list_move: Script::new(LIST_MOVE),
            dequeue_priority: Script::new(DEQUEUE_PRIORITY),
            fetch_for_processing: Script::new(FETCH_FOR_PROCESSING),
            check_rate_limit: Script::new(CHECK_RATE_LIMIT),
            acknowledge_message: Script::new(ACKNOWLEDGE_MESSAGE),
            unacknowledge_messages: Script::new(UNACKNOWLEDGE_MESSAGES),
            release_delayed_and_requeued: Script::new(RELEASE_DELAYED_AND_REQUEUED),
            fire_scheduled_message: Script::new(FIRE_SCHEDULED_MESSAGE),
            fire_periodic_message: Script::new(FIRE_PERIODIC_MESSAGE),
            set_queue_state: Script::new(SET_QUEUE_STATE),
            release_lock: Script::new(RELEASE_LOCK),
            extend_lock: Script::new(EXTEND_LOCK),
        }
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}

const CREATE_QUEUE: &str = r#"
    local properties = KEYS[1]
    local queues_set = KEYS[2]

    local queue_type = ARGV[1]
    local delivery_model = ARGV[2]
    local queue_json = ARGV[3]
    local now = ARGV[4]

    if redis.call('EXISTS', properties) == 1 then
        local existing_type = redis.call('HGET', properties, 'type')
        local existing_model = redis.call('HGET', properties, 'delivery_model')
        if existing_type == queue_type and existing_model == delivery_model then
            return 0
        end
        return -1
    end

    redis.call('HSET', properties,
        'type', queue_type,
        'delivery_model', delivery_model,
        'state', 'ACTIVE',
        'state_changed_at', now,
        'pending_count', 0,
        'processing_count', 0,
        'scheduled_count', 0,
        'delayed_count', 0,
        'requeued_count', 0,
        'dead_lettered_count', 0,
        'acknowledged_count', 0)
    redis.call('SADD', queues_set, queue_json)
    return 1
"#;

const PUBLISH_MESSAGE: &str = r#"
    local properties = KEYS[1]
    local target = KEYS[2]
    local message_key = KEYS[3]

    local mode = ARGV[1]
    local score = ARGV[2]
    local message_id = ARGV[3]
    local counter_field = ARGV[4]

    if redis.call('EXISTS', properties) == 0 then
        return 'QUEUE_NOT_FOUND'
    end
    if redis.call('EXISTS', message_key) == 1 then
        return 'MESSAGE_EXISTS'
    end

    redis.call('HSET', message_key, unpack(ARGV, 5))

    if mode == 'ZADD' then
        redis.call('ZADD', target, score, message_id)
    elseif mode == 'RPUSH' then
        redis.call('RPUSH', target, message_id)
    else
        redis.call('LPUSH', target, message_id)
    end

    redis.call('HINCRBY', properties, counter_field, 1)
    return 'OK'
"#;

const INIT_CONSUMER_QUEUE: &str = r#"
    local properties = KEYS[1]
    local consumers = KEYS[2]
    local processing_queues = KEYS[3]
    local queues_set = KEYS[4]
    local consumer_queues_set = KEYS[5]
    local consumer_groups = KEYS[6]

    local consumer_id = ARGV[1]
    local consumer_info = ARGV[2]
    local processing_key = ARGV[3]
    local queue_json = ARGV[4]
    local consumer_queue_json = ARGV[5]
    local group_id = ARGV[6]

    if redis.call('EXISTS', properties) == 0 then
        return 0
    end

    redis.call('HSET', consumers, consumer_id, consumer_info)
    redis.call('HSET', processing_queues, processing_key, consumer_id)
    redis.call('SADD', queues_set, queue_json)
    redis.call('SADD', consumer_queues_set, consumer_queue_json)
    if group_id ~= '' then
        redis.call('SADD', consumer_groups, group_id)
    end
    return 1
"#;

const UNREGISTER_CONSUMER_QUEUE: &str = r#"
    local consumers = KEYS[1]
    local processing_queues = KEYS[2]
    local consumer_queues_set = KEYS[3]

    local consumer_id = ARGV[1]
    local processing_key = ARGV[2]
    local consumer_queue_json = ARGV[3]

    redis.call('HDEL', processing_queues, processing_key)
    redis.call('SREM', consumer_queues_set, consumer_queue_json)

    -- The consumer stays registered while it reads other groups of the same queue
    if redis.call('SCARD', consumer_queues_set) == 0 or ARGV[4] == '1' then
        redis.call('HDEL', consumers, consumer_id)
    end
    return 1
"#;

// Equivalent of LMOVE for servers older than 6.2
const LIST_MOVE: &str = r#"
    local source = KEYS[1]
    local destination = KEYS[2]
    local direction = ARGV[1]

    local value
    if direction == 'RIGHT_LEFT' then
        value = redis.call('RPOP', source)
        if value then
            redis.call('LPUSH', destination, value)
        end
    else
        value = redis.call('LPOP', source)
        if value then
            redis.call('RPUSH', destination, value)
        end
    end
    return value
"#;

const DEQUEUE_PRIORITY: &str = r#"
    local priority_set = KEYS[1]
    local processing = KEYS[2]

    local ids = redis.call('ZRANGE', priority_set, 0, 0)
    if #ids == 0 then
        return false
    end
    redis.call('ZREM', priority_set, ids[1])
    redis.call('LPUSH', processing, ids[1])
    return ids[1]
"#;

// Pending and processing counters follow the record status, which only this
// script moves from PENDING to PROCESSING. An id popped but not yet fetched is
// still counted as pending.
const FETCH_FOR_PROCESSING: &str = r#"
    local message_key = KEYS[1]
    local properties = KEYS[2]
    local processing = KEYS[3]
    local now = ARGV[1]
    local message_id = ARGV[2]

    if redis.call('EXISTS', message_key) == 0 then
        if redis.call('LREM', processing, 1, message_id) == 1 then
            redis.call('HINCRBY', properties, 'pending_count', -1)
        end
        return {}
    end

    if redis.call('HGET', message_key, 'status') ~= 'PROCESSING' then
        redis.call('HSET', message_key, 'status', 'PROCESSING', 'processing_started_at', now)
        redis.call('HINCRBY', properties, 'pending_count', -1)
        redis.call('HINCRBY', properties, 'processing_count', 1)
    end
    return redis.call('HGETALL', message_key)
"#;

const CHECK_RATE_LIMIT: &str = r#"
    local counter = KEYS[1]
    local limit = tonumber(ARGV[1])
    local ttl = ARGV[2]

    local count = redis.call('INCR', counter)
    if count == 1 then
        redis.call('PEXPIRE', counter, ttl)
    end
    if count > limit then
        return 1
    end
    return 0
"#;

const ACKNOWLEDGE_MESSAGE: &str = r#"
    local processing = KEYS[1]
    local acknowledged = KEYS[2]
    local properties = KEYS[3]
    local message_key = KEYS[4]

    local message_id = ARGV[1]
    local store = ARGV[2]
    local queue_size = tonumber(ARGV[3])
    local expire = tonumber(ARGV[4])
    local message_prefix = ARGV[5]
    local now = ARGV[6]

    if redis.call('LREM', processing, 1, message_id) == 0 then
        return 0
    end

    redis.call('HINCRBY', properties, 'processing_count', -1)
    redis.call('HINCRBY', properties, 'acknowledged_count', 1)

    if store == '1' then
        redis.call('HSET', message_key, 'status', 'ACKNOWLEDGED', 'acknowledged_at', now)
        redis.call('LPUSH', acknowledged, message_id)
        if expire > 0 then
            redis.call('PEXPIRE', message_key, expire)
        end
        if queue_size > 0 then
            local evicted = redis.call('LRANGE', acknowledged, queue_size, -1)
            for _, evicted_id in ipairs(evicted) do
                redis.call('DEL', message_prefix .. evicted_id)
            end
            redis.call('LTRIM', acknowledged, 0, queue_size - 1)
        end
    else
        redis.call('DEL', message_key)
    end
    return 1
"#;

const UNACKNOWLEDGE_MESSAGES: &str = r#"
    local processing = KEYS[1]
    local delayed = KEYS[2]
    local requeued = KEYS[3]
    local dead_lettered = KEYS[4]
    local processing_queues = KEYS[5]
    local consumers = KEYS[6]
    local properties = KEYS[7]

    local ACTION_DELAY = ARGV[1]
    local ACTION_REQUEUE = ARGV[2]
    local ACTION_DEAD_LETTER = ARGV[3]
    local store = ARGV[4]
    local expire = tonumber(ARGV[5])
    local queue_size = tonumber(ARGV[6])
    local message_prefix = ARGV[7]
    local now = ARGV[8]
    local consumer_id = ARGV[9]
    local remove_consumer = ARGV[10]

    local fixed_args = 10
    local per_message = 5
    local processed = 0
    local count = #KEYS - 7

    for i = 1, count do
        local base = fixed_args + (i - 1) * per_message
        local message_id = ARGV[base + 1]
        local action = ARGV[base + 2]
        local dead_letter_reason = ARGV[base + 3]
        local unack_reason = ARGV[base + 4]
        local delay_until = ARGV[base + 5]
        local message_key = KEYS[7 + i]

        local removed = redis.call('LREM', processing, 1, message_id)
        if removed == 1 then
            processed = processed + 1
            -- Never fetched for processing: the id still counts as pending
            local status = redis.call('HGET', message_key, 'status')
            if status and status ~= 'PROCESSING' then
                redis.call('HINCRBY', properties, 'pending_count', -1)
            else
                redis.call('HINCRBY', properties, 'processing_count', -1)
            end
        end

        -- Ids no longer in processing were handled elsewhere; vanished records
        -- only need to leave the processing list
        if removed == 1 and redis.call('EXISTS', message_key) == 1 then
            redis.call('HSET', message_key,
                'unacknowledged_at', now,
                'last_unacknowledged_reason', unack_reason)

            if action == ACTION_DELAY then
                redis.call('ZADD', delayed, delay_until, message_id)
                redis.call('HSET', message_key, 'status', 'UNACK_DELAYING')
                redis.call('HINCRBY', message_key, 'attempts', 1)
                redis.call('HINCRBY', properties, 'delayed_count', 1)
            elseif action == ACTION_REQUEUE then
                redis.call('RPUSH', requeued, message_id)
                redis.call('HSET', message_key, 'status', 'UNACK_REQUEUING', 'requeued_at', now)
                redis.call('HINCRBY', message_key, 'attempts', 1)
                redis.call('HINCRBY', properties, 'requeued_count', 1)
            elseif action == ACTION_DEAD_LETTER then
                redis.call('HINCRBY', properties, 'dead_lettered_count', 1)
                if store == '1' then
                    redis.call('HSET', message_key,
                        'status', 'DEAD_LETTERED',
                        'dead_lettered_at', now,
                        'dead_letter_reason', dead_letter_reason)
                    if dead_letter_reason == 'TTL_EXPIRED' then
                        redis.call('HSET', message_key, 'expired', 1)
                    end
                    redis.call('LPUSH', dead_lettered, message_id)
                    if expire > 0 then
                        redis.call('PEXPIRE', message_key, expire)
                    end
                    if queue_size > 0 then
                        local evicted = redis.call('LRANGE', dead_lettered, queue_size, -1)
                        for _, evicted_id in ipairs(evicted) do
                            redis.call('DEL', message_prefix .. evicted_id)
                        end
                        redis.call('LTRIM', dead_lettered, 0, queue_size - 1)
                    end
                else
                    redis.call('DEL', message_key)
                end
            end
        end
    end

    if remove_consumer == '1' then
        redis.call('HDEL', processing_queues, processing)
        redis.call('HDEL', consumers, consumer_id)
    end

    return processed
"#;

const RELEASE_DELAYED_AND_REQUEUED: &str = r#"
    local delayed = KEYS[1]
    local requeued = KEYS[2]
    local pending = KEYS[3]
    local priority_set = KEYS[4]
    local properties = KEYS[5]

    local now = ARGV[1]
    local message_prefix = ARGV[2]
    local batch_size = tonumber(ARGV[3])

    local queue_type = redis.call('HGET', properties, 'type')
    if not queue_type then
        return {0, 0}
    end

    local function enqueue(message_id)
        local message_key = message_prefix .. message_id
        if redis.call('EXISTS', message_key) == 0 then
            return
        end
        if queue_type == 'PRIORITY' then
            local priority = tonumber(redis.call('HGET', message_key, 'priority')) or 0
            redis.call('ZADD', priority_set, priority, message_id)
        elseif queue_type == 'LIFO' then
            redis.call('RPUSH', pending, message_id)
        else
            redis.call('LPUSH', pending, message_id)
        end
        redis.call('HSET', message_key, 'status', 'PENDING')
        redis.call('HINCRBY', properties, 'pending_count', 1)
    end

    local released_delayed = 0
    local due = redis.call('ZRANGEBYSCORE', delayed, 0, now, 'LIMIT', 0, batch_size)
    for _, message_id in ipairs(due) do
        if redis.call('ZREM', delayed, message_id) == 1 then
            redis.call('HINCRBY', properties, 'delayed_count', -1)
            enqueue(message_id)
            released_delayed = released_delayed + 1
        end
    end

    local released_requeued = 0
    for i = 1, batch_size do
        local message_id = redis.call('LPOP', requeued)
        if not message_id then
            break
        end
        redis.call('HINCRBY', properties, 'requeued_count', -1)
        enqueue(message_id)
        released_requeued = released_requeued + 1
    end

    return {released_delayed, released_requeued}
"#;

const FIRE_SCHEDULED_MESSAGE: &str = r#"
    local scheduled = KEYS[1]
    local target = KEYS[2]
    local properties = KEYS[3]
    local message_key = KEYS[4]

    local message_id = ARGV[1]
    local mode = ARGV[2]
    local score = ARGV[3]
    local now = ARGV[4]

    if redis.call('ZREM', scheduled, message_id) == 0 then
        return 0
    end

    if mode == 'ZADD' then
        redis.call('ZADD', target, score, message_id)
    elseif mode == 'RPUSH' then
        redis.call('RPUSH', target, message_id)
    else
        redis.call('LPUSH', target, message_id)
    end

    redis.call('HSET', message_key, 'status', 'PENDING', 'scheduled_at', now)
    redis.call('HINCRBY', properties, 'scheduled_count', -1)
    redis.call('HINCRBY', properties, 'pending_count', 1)
    return 1
"#;

const FIRE_PERIODIC_MESSAGE: &str = r#"
    local scheduled = KEYS[1]
    local target = KEYS[2]
    local properties = KEYS[3]
    local origin_key = KEYS[4]
    local child_key = KEYS[5]

    local origin_id = ARGV[1]
    local child_id = ARGV[2]
    local mode = ARGV[3]
    local score = ARGV[4]
    local now = tonumber(ARGV[5])
    local next_fire = tonumber(ARGV[6])

    local current = redis.call('ZSCORE', scheduled, origin_id)
    if not current or tonumber(current) > now then
        return 0
    end

    redis.call('HSET', child_key, unpack(ARGV, 7))
    if mode == 'ZADD' then
        redis.call('ZADD', target, score, child_id)
    elseif mode == 'RPUSH' then
        redis.call('RPUSH', target, child_id)
    else
        redis.call('LPUSH', target, child_id)
    end
    redis.call('HINCRBY', properties, 'pending_count', 1)

    if next_fire > 0 then
        redis.call('ZADD', scheduled, next_fire, origin_id)
        redis.call('HINCRBY', origin_key, 'fired_count', 1)
        redis.call('HSET', origin_key, 'scheduled_at', next_fire)
    else
        redis.call('ZREM', scheduled, origin_id)
        redis.call('DEL', origin_key)
        redis.call('HINCRBY', properties, 'scheduled_count', -1)
    end
    return 1
"#;

const SET_QUEUE_STATE: &str = r#"
    local properties = KEYS[1]
    local history = KEYS[2]

    local to = ARGV[1]
    local reason = ARGV[2]
    local description = ARGV[3]
    local metadata = ARGV[4]
    local now = tonumber(ARGV[5])
    local max_history = tonumber(ARGV[6])
    local channel = ARGV[7]
    local queue_json = ARGV[8]
    local system = ARGV[9]
    local expected_from = ARGV[10]

    if redis.call('EXISTS', properties) == 0 then
        return {'QUEUE_NOT_FOUND', ''}
    end

    local from = redis.call('HGET', properties, 'state') or 'ACTIVE'
    if from == to or (expected_from ~= '' and from ~= expected_from) then
        return {'INVALID_TRANSITION', from}
    end
    if system ~= '1' and (from == 'LOCKED' or to == 'LOCKED') then
        return {'QUEUE_LOCKED', from}
    end

    -- Timestamps never go backwards for a given queue
    local last = tonumber(redis.call('HGET', properties, 'state_changed_at')) or 0
    local timestamp = now
    if timestamp <= last then
        timestamp = last + 1
    end

    redis.call('HSET', properties, 'state', to, 'state_changed_at', timestamp)

    local record = {
        from = from,
        to = to,
        reason = reason,
        timestamp = timestamp
    }
    if description ~= '' then
        record['description'] = description
    end
    if metadata ~= '' then
        record['metadata'] = cjson.decode(metadata)
    end

    local record_json = cjson.encode(record)
    redis.call('LPUSH', history, record_json)
    redis.call('LTRIM', history, 0, max_history - 1)

    local event = cjson.encode({ queue = cjson.decode(queue_json), transition = record })
    redis.call('PUBLISH', channel, event)

    return {'OK', record_json}
"#;

const RELEASE_LOCK: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

const EXTEND_LOCK: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    end
    return 0
"#;

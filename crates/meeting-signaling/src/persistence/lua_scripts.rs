//! Lua scripts for the Redis meeting store.
//!
//! Chat appends must allocate the message id and push the record in one step,
//! otherwise two signaling tasks could interleave ids and list order.

/// Append a chat message to a meeting's history.
///
/// Arguments:
/// - KEYS[1]: Sequence key (`meeting:{id}:chat:seq`)
/// - KEYS[2]: History list (`meeting:{id}:chat`)
/// - ARGV[1]: Sender user id
/// - ARGV[2]: Message text
/// - ARGV[3]: Sent-at timestamp (RFC 3339)
///
/// Returns the allocated message id (starts at 1).
pub const APPEND_CHAT: &str = r#"
local seq = redis.call('INCR', KEYS[1])
local record = cjson.encode({
    id = seq,
    senderId = ARGV[1],
    text = ARGV[2],
    sentAt = ARGV[3]
})
redis.call('RPUSH', KEYS[2], record)
return seq
"#;

/// Insert or refresh a participant record.
///
/// Arguments:
/// - KEYS[1]: Participant hash (`meeting:{id}:participant:{user}`)
/// - ARGV[1]: Role
/// - ARGV[2]: Joined-at timestamp (RFC 3339)
///
/// Returns the number of joins recorded for this participant.
pub const RECORD_JOIN: &str = r#"
redis.call('HSET', KEYS[1], 'role', ARGV[1], 'joined_at', ARGV[2])
redis.call('HDEL', KEYS[1], 'left_at')
return redis.call('HINCRBY', KEYS[1], 'join_count', 1)
"#;

/// Claim a meeting's owner slot.
///
/// Arguments:
/// - KEYS[1]: Host key (`meeting:{id}:host`)
/// - ARGV[1]: Claiming user id
///
/// Returns the owner on record after the claim.
pub const CLAIM_HOST: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'NX')
return redis.call('GET', KEYS[1])
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_chat_allocates_before_push() {
        let incr = APPEND_CHAT.find("INCR").unwrap_or(usize::MAX);
        let push = APPEND_CHAT.find("RPUSH").unwrap_or(0);
        assert!(incr < push, "id must be allocated before the record is pushed");
        assert!(APPEND_CHAT.contains("return seq"));
    }

    #[test]
    fn test_record_join_clears_left_at() {
        assert!(RECORD_JOIN.contains("HDEL', KEYS[1], 'left_at'"));
        assert!(RECORD_JOIN.contains("HINCRBY"));
    }

    #[test]
    fn test_claim_host_never_overwrites() {
        assert!(CLAIM_HOST.contains("'NX'"));
        assert!(CLAIM_HOST.contains("return redis.call('GET', KEYS[1])"));
    }
}

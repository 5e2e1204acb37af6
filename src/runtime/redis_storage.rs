use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::debug;

use crate::error::WorkflowError;
use crate::runtime::storage::{snapshot_generation, SnapshotStore};

// KEYS[1] = snapshot hash
// ARGV[1] = expected generation ("" when nothing may be stored yet)
// ARGV[2] = new generation
// ARGV[3] = snapshot json
const SAVE_SCRIPT: &str = r#"
    local current = redis.call("HGET", KEYS[1], "generation")
    if current == false then
        if ARGV[1] ~= "" then
            return {"conflict", ""}
        end
    elseif current ~= ARGV[1] then
        return {"conflict", current}
    end
    redis.call("HSET", KEYS[1], "generation", ARGV[2], "snapshot", ARGV[3])
    return {"ok", ARGV[2]}
"#;

pub struct RedisSnapshotStore {
    client: redis::Client,
    prefix: String,
}

impl RedisSnapshotStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            prefix: "spindle:wf".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    fn snapshot_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.hget(self.snapshot_key(key), "snapshot").await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, key: &str, snapshot: Value, expected: Option<u64>) -> Result<()> {
        let generation = snapshot_generation(&snapshot);
        let expected_arg = expected.map(|g| g.to_string()).unwrap_or_default();
        let json = serde_json::to_string(&snapshot)?;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (status, found): (String, String) = redis::Script::new(SAVE_SCRIPT)
            .key(self.snapshot_key(key))
            .arg(expected_arg)
            .arg(generation)
            .arg(json)
            .invoke_async(&mut conn)
            .await?;

        match status.as_str() {
            "ok" => {
                debug!(key, generation, "snapshot saved to redis");
                Ok(())
            }
            "conflict" => Err(WorkflowError::ConcurrentMutation {
                key: key.to_string(),
                expected: expected.unwrap_or(0),
                found: found.parse().unwrap_or(0),
            }
            .into()),
            other => Err(anyhow!("unexpected reply from save script: {}", other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(self.snapshot_key(key)).await?;
        Ok(())
    }
}

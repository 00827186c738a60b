// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{log::LogEntry, LogIndex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::BTreeMap, sync::Mutex};

/// A deterministic command-application target
///
/// The Raft node drives the machine through an injected trait object; the
/// machine never sees the node. Applying the same entries in the same order
/// must yield the same state and results on every replica.
pub trait StateMachine: Send + Sync {
    /// Applies one committed entry and returns its result.
    ///
    /// Must be deterministic and total: malformed commands yield an error
    /// *result*, never a panic.
    fn apply(&self, entry: &LogEntry) -> Value;

    /// Captures the entire machine state plus `last_applied`.
    fn snapshot(&self) -> Value;

    /// Replaces the in-memory state from a snapshot.
    fn restore(&self, snapshot: &Value) -> crate::Result<()>;

    /// Index of the last applied entry.
    fn last_applied(&self) -> LogIndex;
}

fn bad_command(reason: &str) -> Value {
    json!({ "ok": false, "error": reason })
}

// ---------------------------------------------------------------------------

#[derive(Default, Serialize, Deserialize)]
struct KvState {
    data: BTreeMap<String, Value>,
    last_applied: LogIndex,
}

/// Reference key-value machine: `set`, `get`, `delete`, `cas`
#[derive(Default)]
pub struct KvMachine {
    state: Mutex<KvState>,
}

impl KvMachine {
    /// Creates an empty machine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a key directly, bypassing the log (test/diagnostic use).
    pub fn get(&self, key: &str) -> Option<Value> {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");
        state.data.get(key).cloned()
    }
}

impl StateMachine for KvMachine {
    fn apply(&self, entry: &LogEntry) -> Value {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        let command = &entry.command;

        let result = match command.get("op").and_then(Value::as_str) {
            Some("set") => match (command.get("key").and_then(Value::as_str), command.get("value")) {
                (Some(key), Some(value)) => {
                    state.data.insert(key.to_owned(), value.clone());
                    json!({ "ok": true })
                }
                _ => bad_command("set needs key and value"),
            },
            Some("get") => match command.get("key").and_then(Value::as_str) {
                Some(key) => {
                    let value = state.data.get(key).cloned().unwrap_or(Value::Null);
                    json!({ "ok": true, "value": value })
                }
                None => bad_command("get needs key"),
            },
            Some("delete") => match command.get("key").and_then(Value::as_str) {
                Some(key) => {
                    state.data.remove(key);
                    json!({ "ok": true })
                }
                None => bad_command("delete needs key"),
            },
            Some("cas") => match command.get("key").and_then(Value::as_str) {
                Some(key) => {
                    let current = state.data.get(key).cloned().unwrap_or(Value::Null);
                    let expected = command.get("expected").cloned().unwrap_or(Value::Null);

                    if current == expected {
                        let new = command.get("value").cloned().unwrap_or(Value::Null);
                        state.data.insert(key.to_owned(), new);
                        json!({ "ok": true, "swapped": true })
                    } else {
                        json!({ "ok": true, "swapped": false, "current": current })
                    }
                }
                None => bad_command("cas needs key"),
            },
            _ => bad_command("unknown operation"),
        };

        state.last_applied = entry.index;
        result
    }

    fn snapshot(&self) -> Value {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");

        #[allow(clippy::expect_used)]
        serde_json::to_value(&*state).expect("state is json-representable")
    }

    fn restore(&self, snapshot: &Value) -> crate::Result<()> {
        let restored: KvState = serde_json::from_value(snapshot.clone())?;

        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");
        *state = restored;

        Ok(())
    }

    fn last_applied(&self) -> LogIndex {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");
        state.last_applied
    }
}

// ---------------------------------------------------------------------------

#[derive(Default, Serialize, Deserialize)]
struct LockState {
    locks: BTreeMap<String, Option<String>>,
    last_applied: LogIndex,
}

/// Named-lock registry machine: `acquire`, `release`, `status`
///
/// A lock has at most one holder; re-acquiring an already-held lock is
/// idempotent for its holder.
#[derive(Default)]
pub struct LockMachine {
    state: Mutex<LockState>,
}

impl LockMachine {
    /// Creates an empty machine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for LockMachine {
    fn apply(&self, entry: &LogEntry) -> Value {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        let command = &entry.command;
        let lock = command.get("lock").and_then(Value::as_str);
        let owner = command.get("owner").and_then(Value::as_str);

        let result = match (command.get("op").and_then(Value::as_str), lock) {
            (Some("acquire"), Some(lock)) => {
                let Some(owner) = owner else {
                    state.last_applied = entry.index;
                    return bad_command("acquire needs owner");
                };

                match state.locks.get(lock) {
                    None | Some(None) => {
                        state.locks.insert(lock.to_owned(), Some(owner.to_owned()));
                        json!({ "ok": true, "acquired": true })
                    }
                    Some(Some(holder)) if holder == owner => {
                        json!({ "ok": true, "acquired": true, "already_held": true })
                    }
                    Some(Some(holder)) => {
                        json!({ "ok": true, "acquired": false, "holder": holder })
                    }
                }
            }
            (Some("release"), Some(lock)) => {
                let is_holder = matches!(
                    (state.locks.get(lock), owner),
                    (Some(Some(holder)), Some(owner)) if holder == owner
                );

                if is_holder {
                    state.locks.insert(lock.to_owned(), None);
                    json!({ "ok": true, "released": true })
                } else {
                    json!({ "ok": false, "error": "not lock holder" })
                }
            }
            (Some("status"), Some(lock)) => {
                let holder = state.locks.get(lock).cloned().flatten();
                json!({ "ok": true, "lock": lock, "holder": holder })
            }
            _ => bad_command("unknown operation"),
        };

        state.last_applied = entry.index;
        result
    }

    fn snapshot(&self) -> Value {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");

        #[allow(clippy::expect_used)]
        serde_json::to_value(&*state).expect("state is json-representable")
    }

    fn restore(&self, snapshot: &Value) -> crate::Result<()> {
        let restored: LockState = serde_json::from_value(snapshot.clone())?;

        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");
        *state = restored;

        Ok(())
    }

    fn last_applied(&self) -> LogIndex {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");
        state.last_applied
    }
}

// ---------------------------------------------------------------------------

#[derive(Clone, Default, Serialize, Deserialize)]
struct GroupLeader {
    leader: Option<String>,
    term: u64,
}

#[derive(Default, Serialize, Deserialize)]
struct ElectionState {
    groups: BTreeMap<String, GroupLeader>,
    last_applied: LogIndex,
}

/// Leader-election registry machine: `campaign`, `resign`, `heartbeat`,
/// `get_leader`, per named group
#[derive(Default)]
pub struct ElectionMachine {
    state: Mutex<ElectionState>,
}

impl ElectionMachine {
    /// Creates an empty machine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for ElectionMachine {
    fn apply(&self, entry: &LogEntry) -> Value {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        let command = &entry.command;
        let group = command.get("group").and_then(Value::as_str);
        let node = command.get("node").and_then(Value::as_str);

        let result = match (command.get("op").and_then(Value::as_str), group) {
            (Some("campaign"), Some(group)) => {
                let Some(node) = node else {
                    state.last_applied = entry.index;
                    return bad_command("campaign needs node");
                };

                let current = state.groups.entry(group.to_owned()).or_default();

                if current.leader.is_none() {
                    current.leader = Some(node.to_owned());
                    current.term += 1;
                    json!({ "ok": true, "elected": true, "term": current.term })
                } else {
                    json!({
                        "ok": true,
                        "elected": false,
                        "current_leader": current.leader,
                    })
                }
            }
            (Some("resign"), Some(group)) => match state.groups.get_mut(group) {
                Some(current) if current.leader.as_deref() == node && node.is_some() => {
                    current.leader = None;
                    json!({ "ok": true, "resigned": true })
                }
                _ => json!({ "ok": false, "error": "not the leader" }),
            },
            (Some("heartbeat"), Some(group)) => match state.groups.get(group) {
                Some(current) if current.leader.as_deref() == node && node.is_some() => {
                    json!({ "ok": true, "renewed": true })
                }
                _ => json!({ "ok": false, "error": "not the leader" }),
            },
            (Some("get_leader"), Some(group)) => match state.groups.get(group) {
                Some(current) => json!({
                    "ok": true,
                    "leader": current.leader,
                    "term": current.term,
                }),
                None => json!({ "ok": true, "leader": Value::Null, "term": 0 }),
            },
            _ => bad_command("unknown operation"),
        };

        state.last_applied = entry.index;
        result
    }

    fn snapshot(&self) -> Value {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");

        #[allow(clippy::expect_used)]
        serde_json::to_value(&*state).expect("state is json-representable")
    }

    fn restore(&self, snapshot: &Value) -> crate::Result<()> {
        let restored: ElectionState = serde_json::from_value(snapshot.clone())?;

        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");
        *state = restored;

        Ok(())
    }

    fn last_applied(&self) -> LogIndex {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");
        state.last_applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn entry(index: LogIndex, command: Value) -> LogEntry {
        LogEntry {
            term: 1,
            index,
            command,
        }
    }

    #[test]
    fn kv_machine_set_get_delete() {
        let machine = KvMachine::new();

        machine.apply(&entry(1, json!({"op": "set", "key": "a", "value": "1"})));

        let result = machine.apply(&entry(2, json!({"op": "get", "key": "a"})));
        assert_eq!(json!({"ok": true, "value": "1"}), result);

        machine.apply(&entry(3, json!({"op": "delete", "key": "a"})));

        let result = machine.apply(&entry(4, json!({"op": "get", "key": "a"})));
        assert_eq!(json!({"ok": true, "value": null}), result);

        assert_eq!(4, machine.last_applied());
    }

    #[test]
    fn kv_machine_cas() {
        let machine = KvMachine::new();

        machine.apply(&entry(1, json!({"op": "set", "key": "k", "value": "v0"})));

        let result = machine.apply(&entry(
            2,
            json!({"op": "cas", "key": "k", "expected": "v0", "value": "v1"}),
        ));
        assert_eq!(json!({"ok": true, "swapped": true}), result);

        // Second identical CAS loses and reports the current value
        let result = machine.apply(&entry(
            3,
            json!({"op": "cas", "key": "k", "expected": "v0", "value": "v2"}),
        ));
        assert_eq!(json!({"ok": true, "swapped": false, "current": "v1"}), result);
    }

    #[test]
    fn kv_machine_rejects_malformed_commands() {
        let machine = KvMachine::new();

        let result = machine.apply(&entry(1, json!({"op": "frobnicate"})));
        assert_eq!(Some(false), result.get("ok").and_then(Value::as_bool));

        let result = machine.apply(&entry(2, json!({"op": "set"})));
        assert_eq!(Some(false), result.get("ok").and_then(Value::as_bool));
    }

    #[test]
    fn kv_machine_snapshot_restore() -> crate::Result<()> {
        let machine = KvMachine::new();

        machine.apply(&entry(1, json!({"op": "set", "key": "a", "value": "1"})));
        machine.apply(&entry(2, json!({"op": "set", "key": "b", "value": "2"})));

        let snapshot = machine.snapshot();

        let replica = KvMachine::new();
        replica.restore(&snapshot)?;

        assert_eq!(Some(json!("1")), replica.get("a"));
        assert_eq!(2, replica.last_applied());

        Ok(())
    }

    #[test]
    fn lock_machine_exclusive_acquire() {
        let machine = LockMachine::new();

        let result = machine.apply(&entry(
            1,
            json!({"op": "acquire", "lock": "m", "owner": "alice"}),
        ));
        assert_eq!(Some(true), result.get("acquired").and_then(Value::as_bool));

        let result = machine.apply(&entry(
            2,
            json!({"op": "acquire", "lock": "m", "owner": "bob"}),
        ));
        assert_eq!(Some(false), result.get("acquired").and_then(Value::as_bool));
        assert_eq!(Some("alice"), result.get("holder").and_then(Value::as_str));

        // Re-acquire by the holder is idempotent
        let result = machine.apply(&entry(
            3,
            json!({"op": "acquire", "lock": "m", "owner": "alice"}),
        ));
        assert_eq!(Some(true), result.get("already_held").and_then(Value::as_bool));
    }

    #[test]
    fn lock_machine_release_by_non_holder_fails() {
        let machine = LockMachine::new();

        machine.apply(&entry(
            1,
            json!({"op": "acquire", "lock": "m", "owner": "alice"}),
        ));

        let result = machine.apply(&entry(
            2,
            json!({"op": "release", "lock": "m", "owner": "bob"}),
        ));
        assert_eq!(Some(false), result.get("ok").and_then(Value::as_bool));

        let result = machine.apply(&entry(
            3,
            json!({"op": "release", "lock": "m", "owner": "alice"}),
        ));
        assert_eq!(Some(true), result.get("released").and_then(Value::as_bool));

        // Now bob can take it
        let result = machine.apply(&entry(
            4,
            json!({"op": "acquire", "lock": "m", "owner": "bob"}),
        ));
        assert_eq!(Some(true), result.get("acquired").and_then(Value::as_bool));
    }

    #[test]
    fn election_machine_campaign_resign() {
        let machine = ElectionMachine::new();

        let result = machine.apply(&entry(
            1,
            json!({"op": "campaign", "group": "g", "node": "n1"}),
        ));
        assert_eq!(Some(true), result.get("elected").and_then(Value::as_bool));
        assert_eq!(Some(1), result.get("term").and_then(Value::as_u64));

        // A live leader wins against challengers
        let result = machine.apply(&entry(
            2,
            json!({"op": "campaign", "group": "g", "node": "n2"}),
        ));
        assert_eq!(Some(false), result.get("elected").and_then(Value::as_bool));

        let result = machine.apply(&entry(
            3,
            json!({"op": "heartbeat", "group": "g", "node": "n1"}),
        ));
        assert_eq!(Some(true), result.get("renewed").and_then(Value::as_bool));

        machine.apply(&entry(4, json!({"op": "resign", "group": "g", "node": "n1"})));

        let result = machine.apply(&entry(
            5,
            json!({"op": "campaign", "group": "g", "node": "n2"}),
        ));
        assert_eq!(Some(true), result.get("elected").and_then(Value::as_bool));
        assert_eq!(Some(2), result.get("term").and_then(Value::as_u64));
    }
}

//! Storage subscriptions that follow the chain's runtime.
//!
//! Each watch holds one `state_subscribeStorage` listener built from the
//! current metadata. When the connection publishes new metadata the key is
//! re-encoded and the listener replaced; the replacement registers before the
//! old one is dropped, so an unchanged key keeps its wire subscription and the
//! last raw value is replayed and decoded again under the new metadata.

use std::sync::Arc;

use primitive_types::U256;
use serde_json::{Value as JsonValue, json};
use tally_codec::{Metadata, Value, ss58};
use tally_core::{TokenRef, Unsubscribe};
use tally_network::{ConnectionHandle, SubscriptionEvent};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ModuleContext, ModuleUpdate, UpdateSink};
use crate::error::BalanceError;
use crate::record::Amounts;

/// Turns a decoded storage value (`None` when an optional entry is absent)
/// into amounts.
pub(crate) type Extract = fn(Option<&Value>) -> Result<Amounts, String>;

pub(crate) struct StorageQuery {
    pub pallet: &'static str,
    pub item: &'static str,
    pub args: Vec<Value>,
    pub extract: Extract,
}

/// Key argument for an `AccountId32`.
pub(crate) fn account_arg(address: &str) -> Result<Value, BalanceError> {
    Ok(Value::Bytes(ss58::parse_account_id(address)?.to_vec()))
}

/// Unsigned integer at a field path.
pub(crate) fn amount(value: &Value, path: &[&str]) -> Result<U256, String> {
    value
        .at(path)
        .and_then(Value::as_u256)
        .ok_or_else(|| format!("no unsigned integer at {}", path.join(".")))
}

/// Watch `query` on the token's chain, reporting through `on_update`.
pub(crate) fn watch(
    ctx: &ModuleContext,
    token: &TokenRef,
    query: StorageQuery,
    on_update: UpdateSink,
) -> Result<Unsubscribe, BalanceError> {
    let handle = ctx.substrate.acquire(&token.chain.key())?;
    let task = tokio::spawn(run(handle, query, on_update));
    Ok(Unsubscribe::new(move || task.abort()))
}

struct Active {
    metadata: Arc<Metadata>,
    key: String,
    generation: u64,
    _listener: Unsubscribe,
}

async fn run(handle: ConnectionHandle, query: StorageQuery, on_update: UpdateSink) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(u64, SubscriptionEvent)>();
    let mut metadata = handle.metadata_updates();
    let mut seen: Option<Arc<Metadata>> = None;
    let mut active: Option<Active> = None;
    let mut generation = 0u64;

    loop {
        let current = metadata.borrow_and_update().clone();
        if let Some(md) = current
            && seen.as_ref().is_none_or(|s| !Arc::ptr_eq(s, &md))
        {
            seen = Some(Arc::clone(&md));
            generation += 1;
            let next = listen(&handle, &query, md, generation, &tx, &on_update);
            // The previous listener is dropped only after the new one exists.
            active = next;
        }

        tokio::select! {
            changed = metadata.changed() => {
                if changed.is_err() {
                    debug!(chain = handle.chain(), "Connection closed, storage watch ends");
                    on_update(ModuleUpdate::Stale);
                    return;
                }
            }
            Some((event_generation, event)) = rx.recv() => {
                let Some(active) = active.as_ref() else { continue };
                if event_generation != active.generation {
                    continue;
                }
                let update = match event {
                    SubscriptionEvent::Update(change_set) => read_change(active, &query, &change_set),
                    SubscriptionEvent::Disconnected => Some(ModuleUpdate::Stale),
                    SubscriptionEvent::Error(e) => Some(ModuleUpdate::from_connector_error(&e)),
                };
                if let Some(update) = update {
                    on_update(update);
                }
            }
        }
    }
}

fn listen(
    handle: &ConnectionHandle,
    query: &StorageQuery,
    metadata: Arc<Metadata>,
    generation: u64,
    tx: &mpsc::UnboundedSender<(u64, SubscriptionEvent)>,
    on_update: &UpdateSink,
) -> Option<Active> {
    let key = match tally_codec::encode_key_hex(&metadata, query.pallet, query.item, &query.args) {
        Ok(key) => key,
        Err(e) => {
            warn!(chain = handle.chain(), pallet = query.pallet, item = query.item, "Cannot build storage key: {e}");
            on_update(ModuleUpdate::Error(format!("{}.{}: {e}", query.pallet, query.item)));
            return None;
        }
    };

    let tx = tx.clone();
    let listener = handle.subscribe("state_subscribeStorage", json!([[key]]), move |event| {
        let _ = tx.send((generation, event));
    });
    match listener {
        Ok(listener) => Some(Active {
            metadata,
            key,
            generation,
            _listener: listener,
        }),
        Err(e) => {
            on_update(ModuleUpdate::from_connector_error(&e));
            None
        }
    }
}

/// Decode our key's entry of a `state_storage` change set. `None` when the
/// set does not mention the key.
fn read_change(active: &Active, query: &StorageQuery, change_set: &JsonValue) -> Option<ModuleUpdate> {
    let Some(changes) = change_set.get("changes").and_then(JsonValue::as_array) else {
        return Some(ModuleUpdate::Error("malformed storage change set".into()));
    };
    let change = changes.iter().find(|c| {
        c.get(0)
            .and_then(JsonValue::as_str)
            .is_some_and(|k| k.eq_ignore_ascii_case(&active.key))
    })?;

    let md = &active.metadata;
    let value = match change.get(1).and_then(JsonValue::as_str) {
        Some(raw) => {
            let bytes = match hex::decode(raw.trim_start_matches("0x")) {
                Ok(bytes) => bytes,
                Err(e) => return Some(ModuleUpdate::Error(format!("storage value is not hex: {e}"))),
            };
            match tally_codec::decode(md, query.pallet, query.item, &bytes) {
                Some(value) => Some(value),
                None => {
                    return Some(ModuleUpdate::Error(format!(
                        "undecodable {}.{} value",
                        query.pallet, query.item
                    )));
                }
            }
        }
        None => match tally_codec::storage_default(md, query.pallet, query.item) {
            Ok(default) => default,
            Err(e) => return Some(ModuleUpdate::Error(e.to_string())),
        },
    };

    Some(match (query.extract)(value.as_ref()) {
        Ok(amounts) => ModuleUpdate::Balance(amounts),
        Err(reason) => ModuleUpdate::Error(reason),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_codec::metadata::fixtures;

    fn free_only(value: Option<&Value>) -> Result<Amounts, String> {
        match value {
            Some(v) => amount(v, &["data", "free"]).map(Amounts::free_only),
            None => Ok(Amounts::zero()),
        }
    }

    fn query() -> StorageQuery {
        StorageQuery {
            pallet: "System",
            item: "Account",
            args: vec![Value::Bytes(vec![1; 32])],
            extract: free_only,
        }
    }

    fn active(key: &str) -> Active {
        Active {
            metadata: Arc::new(fixtures::metadata()),
            key: key.into(),
            generation: 1,
            _listener: Unsubscribe::noop(),
        }
    }

    #[test]
    fn absent_value_uses_storage_default() {
        let a = active("0xAB");
        let set = json!({ "block": "0x01", "changes": [["0xab", null]] });
        assert_eq!(
            read_change(&a, &query(), &set),
            Some(ModuleUpdate::Balance(Amounts::zero()))
        );
    }

    #[test]
    fn unrelated_keys_are_ignored() {
        let a = active("0xab");
        let set = json!({ "block": "0x01", "changes": [["0xcd", null]] });
        assert_eq!(read_change(&a, &query(), &set), None);
    }

    #[test]
    fn corrupt_bytes_become_errors() {
        let a = active("0xab");
        let set = json!({ "changes": [["0xab", "0x0102"]] });
        assert!(matches!(read_change(&a, &query(), &set), Some(ModuleUpdate::Error(_))));
        let set = json!({ "changes": [["0xab", "0xzz"]] });
        assert!(matches!(read_change(&a, &query(), &set), Some(ModuleUpdate::Error(_))));
        assert!(matches!(
            read_change(&a, &query(), &json!({ "nope": 1 })),
            Some(ModuleUpdate::Error(_))
        ));
    }

    #[test]
    fn account_args_accept_ss58_and_hex() {
        let ss58 = account_arg("5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY").unwrap();
        let hex = account_arg("0xd43593c715fdd31c61141abd04a99fd6822c8558854ccde39a5684e7a56da27d").unwrap();
        assert_eq!(ss58, hex);
        assert!(matches!(account_arg("bogus"), Err(BalanceError::InvalidAddress(_))));
    }
}

//! Per-key record of unresolved optimistic layers.
//!
//! Each key with pending mutations keeps one base value (what it held before
//! the oldest unresolved mutation) and the resolved transforms stacked on top,
//! in apply order. When a mutation fails underneath later ones, the key is
//! re-derived from the base by replaying the surviving layers instead of being
//! overwritten with a snapshot that predates them.

use std::collections::HashMap;

use crate::cache::{CacheKey, FilterSchema};

use super::snapshot::Prior;
use super::transform::Transform;

pub(crate) type MutationId = u64;

struct Layer {
  mutation: MutationId,
  transform: Transform,
  confirmed: bool,
}

struct PendingKey {
  base: Prior,
  layers: Vec<Layer>,
}

/// How to put a key back after a mutation fails.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RollbackPlan {
  /// The failed mutation was topmost; restore its snapshot as taken
  Verbatim,
  /// Later mutations are still stacked on top; write this value instead
  Rederived(Prior),
}

#[derive(Default)]
pub(crate) struct Ledger {
  keys: HashMap<CacheKey, PendingKey>,
}

impl Ledger {
  pub fn record(&mut self, key: &CacheKey, mutation: MutationId, prior: &Prior, transform: &Transform) {
    let pending = self
      .keys
      .entry(key.clone())
      .or_insert_with(|| PendingKey {
        base: prior.clone(),
        layers: Vec::new(),
      });
    pending.layers.push(Layer {
      mutation,
      transform: transform.clone(),
      confirmed: false,
    });
  }

  pub fn pending_layers(&self, key: &CacheKey) -> usize {
    self.keys.get(key).map_or(0, |p| p.layers.len())
  }

  /// Mark `mutation` confirmed. Confirmed layers at the bottom of the stack
  /// are folded into the base.
  pub fn settle(&mut self, key: &CacheKey, mutation: MutationId, schema: Option<&FilterSchema>) {
    let Some(pending) = self.keys.get_mut(key) else {
      return;
    };
    if let Some(layer) = pending.layers.iter_mut().find(|l| l.mutation == mutation) {
      layer.confirmed = true;
    }
    while pending.layers.first().is_some_and(|l| l.confirmed) {
      let layer = pending.layers.remove(0);
      pending.base = Prior::from(layer.transform.apply(key, pending.base.as_entry(), schema));
    }
    if pending.layers.is_empty() {
      self.keys.remove(key);
    }
  }

  pub fn rollback(
    &mut self,
    key: &CacheKey,
    mutation: MutationId,
    schema: Option<&FilterSchema>,
  ) -> RollbackPlan {
    let Some(pending) = self.keys.get_mut(key) else {
      return RollbackPlan::Verbatim;
    };
    let Some(position) = pending.layers.iter().position(|l| l.mutation == mutation) else {
      return RollbackPlan::Verbatim;
    };

    let topmost = position + 1 == pending.layers.len();
    pending.layers.remove(position);

    let plan = if topmost {
      RollbackPlan::Verbatim
    } else {
      let value = pending
        .layers
        .iter()
        .fold(pending.base.as_entry().cloned(), |value, layer| {
          layer.transform.apply(key, value.as_ref(), schema)
        });
      RollbackPlan::Rederived(Prior::from(value))
    };

    if pending.layers.is_empty() {
      self.keys.remove(key);
    }
    plan
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheEntry, Entity, KeyFactory};
  use serde_json::json;

  fn key() -> CacheKey {
    KeyFactory::default().detail_key("newsletters", "a").unwrap()
  }

  fn entity(liked: bool, read: bool) -> Prior {
    Prior::Present(CacheEntry::Entity(
      Entity::from_value(json!({"id": "a", "is_liked": liked, "is_read": read})).unwrap(),
    ))
  }

  fn flag(prior: &Prior, field: &str) -> Option<bool> {
    prior
      .as_entry()
      .and_then(CacheEntry::as_entity)
      .and_then(|e| e.get(field))
      .and_then(|v| v.as_bool())
  }

  #[test]
  fn test_topmost_failure_is_verbatim() {
    let mut ledger = Ledger::default();
    ledger.record(&key(), 1, &entity(false, false), &Transform::set_flag("a", "is_liked", true));
    assert_eq!(ledger.rollback(&key(), 1, None), RollbackPlan::Verbatim);
    assert_eq!(ledger.pending_layers(&key()), 0);
  }

  #[test]
  fn test_buried_failure_rederives_from_base() {
    let mut ledger = Ledger::default();
    ledger.record(&key(), 1, &entity(false, false), &Transform::set_flag("a", "is_liked", true));
    ledger.record(&key(), 2, &entity(true, false), &Transform::set_flag("a", "is_read", true));

    let RollbackPlan::Rederived(value) = ledger.rollback(&key(), 1, None) else {
      panic!("expected re-derivation");
    };
    assert_eq!(flag(&value, "is_liked"), Some(false));
    assert_eq!(flag(&value, "is_read"), Some(true));
    assert_eq!(ledger.pending_layers(&key()), 1);
  }

  #[test]
  fn test_confirmed_layers_survive_rederivation() {
    let mut ledger = Ledger::default();
    ledger.record(&key(), 1, &entity(false, false), &Transform::set_flag("a", "is_liked", true));
    ledger.record(&key(), 2, &entity(true, false), &Transform::set_flag("a", "is_read", true));
    ledger.record(&key(), 3, &entity(true, true), &Transform::set_flag("a", "is_liked", false));

    // 2 confirmed but stays stacked above the unresolved 1
    ledger.settle(&key(), 2, None);
    assert_eq!(ledger.pending_layers(&key()), 3);

    let RollbackPlan::Rederived(value) = ledger.rollback(&key(), 1, None) else {
      panic!("expected re-derivation");
    };
    assert_eq!(flag(&value, "is_read"), Some(true));
    assert_eq!(flag(&value, "is_liked"), Some(false));

    // 2 is now at the bottom and confirmed, so settling 3 clears the key
    ledger.settle(&key(), 3, None);
    assert_eq!(ledger.pending_layers(&key()), 0);
  }
}

//! Operation invalidation policies.
//!
//! Each mutating operation names the cache regions a confirmed write can
//! affect. The table is static so the full blast radius of every operation is
//! enumerable.

use crate::cache::{KeyFactory, KeyPattern, RefetchPolicy};
use crate::error::Result;
use crate::newsletters::schema::{
  NEWSLETTERS, NEWSLETTER_SOURCES, READING_QUEUE, SOURCE_GROUPS, UNREAD_COUNT,
};

use super::batcher::InvalidationRequest;

/// A cache region refreshed after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
  /// The detail key of every mutated id
  Detail,
  /// Every list view of an entity
  Lists(&'static str),
  /// Every list view of every entity
  AllLists,
  /// Every relation view of an entity (e.g. all reading queues)
  Relations(&'static str),
  /// Relation views anchored at one of the mutated ids
  RelationsOfIds,
  /// A derived counter
  Aggregate(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct OperationPolicy {
  pub operation: &'static str,
  /// Entity the operation's ids belong to
  pub entity: &'static str,
  pub targets: &'static [Target],
  pub refetch: RefetchPolicy,
}

pub const LIKE_TOGGLE: &str = "like-toggle";
pub const READ_TOGGLE: &str = "read-toggle";
pub const ARCHIVE: &str = "archive";
pub const UNARCHIVE: &str = "unarchive";
pub const DELETE: &str = "delete";
pub const QUEUE_ADD: &str = "queue-add";
pub const QUEUE_REMOVE: &str = "queue-remove";
pub const SOURCE_UPDATE: &str = "source-update";

const MEMBERSHIP_TARGETS: &[Target] = &[
  Target::Lists(NEWSLETTERS),
  Target::Aggregate(UNREAD_COUNT),
  Target::Detail,
];

const QUEUE_TARGETS: &[Target] = &[Target::Relations(READING_QUEUE), Target::Detail];

pub const POLICIES: &[OperationPolicy] = &[
  // Rely on the optimistic value; a confirmatory read would only cost bandwidth
  OperationPolicy {
    operation: LIKE_TOGGLE,
    entity: NEWSLETTERS,
    targets: &[Target::Detail],
    refetch: RefetchPolicy::None,
  },
  OperationPolicy {
    operation: READ_TOGGLE,
    entity: NEWSLETTERS,
    targets: &[
      Target::Detail,
      Target::Aggregate(UNREAD_COUNT),
      Target::Lists(NEWSLETTERS),
    ],
    refetch: RefetchPolicy::Active,
  },
  OperationPolicy {
    operation: ARCHIVE,
    entity: NEWSLETTERS,
    targets: MEMBERSHIP_TARGETS,
    refetch: RefetchPolicy::Active,
  },
  OperationPolicy {
    operation: UNARCHIVE,
    entity: NEWSLETTERS,
    targets: MEMBERSHIP_TARGETS,
    refetch: RefetchPolicy::Active,
  },
  OperationPolicy {
    operation: DELETE,
    entity: NEWSLETTERS,
    targets: &[
      Target::Lists(NEWSLETTERS),
      Target::Aggregate(UNREAD_COUNT),
      Target::Detail,
      Target::Relations(READING_QUEUE),
      Target::RelationsOfIds,
    ],
    refetch: RefetchPolicy::Active,
  },
  OperationPolicy {
    operation: QUEUE_ADD,
    entity: NEWSLETTERS,
    targets: QUEUE_TARGETS,
    refetch: RefetchPolicy::Active,
  },
  OperationPolicy {
    operation: QUEUE_REMOVE,
    entity: NEWSLETTERS,
    targets: QUEUE_TARGETS,
    refetch: RefetchPolicy::Active,
  },
  OperationPolicy {
    operation: SOURCE_UPDATE,
    entity: NEWSLETTER_SOURCES,
    targets: &[
      Target::Lists(NEWSLETTER_SOURCES),
      Target::Detail,
      Target::Relations(SOURCE_GROUPS),
      Target::Lists(NEWSLETTERS),
    ],
    refetch: RefetchPolicy::Active,
  },
];

/// Applied to operations missing from the table.
pub const FALLBACK: OperationPolicy = OperationPolicy {
  operation: "*",
  entity: "",
  targets: &[Target::AllLists],
  refetch: RefetchPolicy::Active,
};

pub fn lookup(table: &'static [OperationPolicy], operation: &str) -> Option<&'static OperationPolicy> {
  table.iter().find(|policy| policy.operation == operation)
}

impl OperationPolicy {
  /// Concrete invalidation requests for `ids`, in target order. Patterns that
  /// several targets produce are emitted once.
  pub fn expand(&self, keys: &KeyFactory, ids: &[String]) -> Result<Vec<InvalidationRequest>> {
    let mut requests: Vec<InvalidationRequest> = Vec::new();
    let mut push = |pattern: KeyPattern, exact: bool| {
      let request = InvalidationRequest {
        pattern,
        exact,
        refetch: self.refetch,
      };
      if !requests.contains(&request) {
        requests.push(request);
      }
    };

    for target in self.targets {
      match *target {
        Target::Detail => {
          for id in ids {
            push(KeyPattern::Key(keys.detail_key(self.entity, id)?), true);
          }
        }
        Target::Lists(entity) => push(KeyPattern::lists(entity), false),
        Target::AllLists => push(KeyPattern::all_lists(), false),
        Target::Relations(entity) => push(KeyPattern::relations(entity), false),
        Target::RelationsOfIds => {
          for id in ids {
            push(
              KeyPattern::RelationsOf {
                entity: self.entity.to_string(),
                id: id.clone(),
              },
              false,
            );
          }
        }
        Target::Aggregate(entity) => push(KeyPattern::Entity(entity.to_string()), false),
      }
    }
    Ok(requests)
  }
}

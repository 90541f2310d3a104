//! Entity tables and the filter fields each list view accepts.

use crate::cache::{FieldDefault, FieldMatch, FieldSpec, FilterSchema};

pub const NEWSLETTERS: &str = "newsletters";
pub const NEWSLETTER_SOURCES: &str = "newsletter_sources";
pub const SOURCE_GROUPS: &str = "source_groups";
pub const READING_QUEUE: &str = "reading_queue";
pub const PROFILES: &str = "profiles";
/// Derived counter, cached as an aggregate under an unfiltered list key
pub const UNREAD_COUNT: &str = "unread_count";

pub const IS_ARCHIVED: &str = "is_archived";
pub const IS_READ: &str = "is_read";
pub const IS_LIKED: &str = "is_liked";

pub static NEWSLETTER_FILTERS: FilterSchema = FilterSchema {
  entity: NEWSLETTERS,
  fields: &[
    FieldSpec {
      name: "isArchived",
      column: IS_ARCHIVED,
      matching: FieldMatch::Eq,
      default: Some(FieldDefault::Bool(false)),
    },
    FieldSpec {
      name: "isRead",
      column: IS_READ,
      matching: FieldMatch::Eq,
      default: None,
    },
    FieldSpec {
      name: "isLiked",
      column: IS_LIKED,
      matching: FieldMatch::Eq,
      default: None,
    },
    FieldSpec {
      name: "sourceIds",
      column: "newsletter_source_id",
      matching: FieldMatch::AnyOf,
      default: Some(FieldDefault::EmptyList),
    },
    FieldSpec {
      name: "tagIds",
      column: "tag_ids",
      matching: FieldMatch::Overlaps,
      default: Some(FieldDefault::EmptyList),
    },
    FieldSpec {
      name: "search",
      column: "title",
      matching: FieldMatch::Search,
      default: None,
    },
    FieldSpec {
      name: "sortBy",
      column: "received_at",
      matching: FieldMatch::Order,
      default: Some(FieldDefault::Str("newest")),
    },
    FieldSpec {
      name: "page",
      column: "offset",
      matching: FieldMatch::Page,
      default: Some(FieldDefault::Int(0)),
    },
  ],
};

pub static SOURCE_FILTERS: FilterSchema = FilterSchema {
  entity: NEWSLETTER_SOURCES,
  fields: &[
    FieldSpec {
      name: "isArchived",
      column: IS_ARCHIVED,
      matching: FieldMatch::Eq,
      default: Some(FieldDefault::Bool(false)),
    },
    FieldSpec {
      name: "search",
      column: "name",
      matching: FieldMatch::Search,
      default: None,
    },
  ],
};

pub static SCHEMAS: &[&FilterSchema] = &[&NEWSLETTER_FILTERS, &SOURCE_FILTERS];

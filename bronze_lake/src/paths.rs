use bronze_types::{ChangeEvent, EventId, PartitionId, Position, Source};
use chrono::prelude::*;
use object_store::path::Path as ObjPath;
use std::{fmt::Display, ops::Deref};

/// File extension of lake objects and dead-letter records
pub const LAKE_FILE_EXTENSION: &str = "json";

/// `{source}/{entity}/year={Y}/month={M}/day={D}/data_{event id}.json`
///
/// The date is the UTC calendar date of the change in its source system. Each component is a
/// single path segment: characters that are not allowed in a segment, including `/`, are
/// percent-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LakeObjectKey(ObjPath);

impl LakeObjectKey {
    pub fn new(source: Source, entity: &str, date: DateTime<Utc>, event_id: &EventId) -> Self {
        let path = ObjPath::from_iter([
            source.as_str(),
            entity,
            format!("year={}", date.year()).as_str(),
            format!("month={}", date.month()).as_str(),
            format!("day={}", date.day()).as_str(),
            format!("data_{event_id}.{LAKE_FILE_EXTENSION}").as_str(),
        ]);
        Self(path)
    }

    pub fn for_event(event: &ChangeEvent) -> Self {
        Self::new(
            event.source,
            &event.entity,
            event.source_timestamp,
            &event.event_id(),
        )
    }

    /// Prefix holding every object of one entity.
    pub fn entity_dir(source: Source, entity: &str) -> ObjPath {
        ObjPath::from_iter([source.as_str(), entity])
    }
}

impl Deref for LakeObjectKey {
    type Target = ObjPath;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<ObjPath> for LakeObjectKey {
    fn as_ref(&self) -> &ObjPath {
        &self.0
    }
}

impl Display for LakeObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// `{prefix}/{source}/partition={P}/offset_{offset:020}.json`
///
/// Keyed by channel position, so a poison event that is delivered again replaces its own record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPath(ObjPath);

impl DeadLetterPath {
    pub fn new(prefix: &str, source: Source, partition: PartitionId, offset: Position) -> Self {
        let path = ObjPath::from_iter([
            prefix,
            source.as_str(),
            format!("partition={partition}").as_str(),
            format!("offset_{:020}.{LAKE_FILE_EXTENSION}", offset.get()).as_str(),
        ]);
        Self(path)
    }

    pub fn dir(prefix: &str, source: Source) -> ObjPath {
        ObjPath::from_iter([prefix, source.as_str()])
    }
}

impl Deref for DeadLetterPath {
    type Target = ObjPath;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<ObjPath> for DeadLetterPath {
    fn as_ref(&self) -> &ObjPath {
        &self.0
    }
}

impl Display for DeadLetterPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Legacy field types recognized on old-profile records.
pub const TYPE_CHECKSUM: &str = "CHECKSUM";
pub const TYPE_URL: &str = "URL";
pub const TYPE_ROR: &str = "ROR";
pub const TYPE_ROR_EUDAT: &str = "EUDAT/ROR";
pub const TYPE_PPID: &str = "PPID";
pub const TYPE_PPID_EUDAT: &str = "EUDAT/PPID";
pub const TYPE_LOCATION_LIST: &str = "10320/LOC";

/// Field types written by the new profile.
pub const TYPE_NEW_CHECKSUM: &str = "EUDAT/CHECKSUM";
pub const TYPE_NEW_CHECKSUM_TIMESTAMP: &str = "EUDAT/CHECKSUM_TIMESTAMP";
pub const TYPE_NEW_FIXED_CONTENT: &str = "EUDAT/FIXED_CONTENT";
pub const TYPE_NEW_ROR: &str = "EUDAT/ROR";
pub const TYPE_NEW_FIO: &str = "EUDAT/FIO";
pub const TYPE_NEW_REPLICA: &str = "EUDAT/REPLICA";
pub const TYPE_NEW_PARENT: &str = "EUDAT/PARENT";
pub const TYPE_PROFILE_VERSION: &str = "EUDAT/PROFILE_VERSION";

/// Fixed indexes assigned to fields introduced by the new profile.
pub const INDEX_PROFILE_VERSION: u32 = 1000;
pub const INDEX_FIXED_CONTENT: u32 = 1010;
pub const INDEX_CHECKSUM_TIMESTAMP: u32 = 1110;
pub const INDEX_ROR: u32 = 1120;
pub const INDEX_FIO: u32 = 1130;

/// Handle System administrative types, never part of a profile record.
const ADMIN_TYPES: [&str; 7] =
    ["HS_ADMIN", "HS_SITE", "HS_PUBKEY", "HS_SECKEY", "HS_ALIAS", "HS_VLIST", "HS_SERV"];

/// Resolution-URL prefixes that legacy pointer values sometimes carry.
const RESOLUTION_URL_PREFIXES: [&str; 2] =
    ["http://hdl.handle.net/", "https://hdl.handle.net/"];

/// Hard bound on replica-chain traversal; beyond this the chain is assumed cyclic.
pub const MAX_CHAIN_HOPS: u32 = 100;

const LEASE_SECONDS: u32 = 86_400;
const PERMISSION_CODE: &str = "1110";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrationError {
    #[error("malformed field: {0}")]
    MalformedField(String),
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("replica chain exceeded {} hops; last predecessor: {last_predecessor}", MAX_CHAIN_HOPS)]
    CycleGuard { last_predecessor: String },
    #[error("remote resolution failed: {0}")]
    Connectivity(String),
    #[error("invalid location list: {0}")]
    LocationList(String),
}

/// One raw field row as read from the legacy store or remote resolution,
/// before index validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    pub index: i64,
    pub field_type: String,
    pub value: String,
    pub timestamp: Option<i64>,
}

/// One validated field of a Handle record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldEntry {
    pub index: u32,
    pub field_type: String,
    pub value: String,
    pub timestamp: Option<i64>,
}

/// Case-insensitive type lookup plus original field order for one record.
///
/// Administrative Handle System fields are dropped at construction and are
/// never reachable through either view. Built once per record and discarded
/// after the record's statements are emitted.
#[derive(Debug, Clone, Default)]
pub struct FieldIndex {
    by_type: HashMap<String, usize>,
    ordered: Vec<FieldEntry>,
}

impl FieldIndex {
    /// Normalize a raw field list into the per-record lookup structure.
    ///
    /// # Errors
    /// Returns [`MigrationError::MalformedField`] when a raw row's index is
    /// not representable as a non-negative integer.
    pub fn build(rows: Vec<RawField>) -> Result<Self, MigrationError> {
        let mut index = Self::default();
        for row in rows {
            let field_type = row.field_type.to_uppercase();
            if ADMIN_TYPES.contains(&field_type.as_str()) {
                continue;
            }
            let idx = u32::try_from(row.index).map_err(|_| {
                MigrationError::MalformedField(format!(
                    "field index {} of type {field_type} is not a non-negative integer",
                    row.index
                ))
            })?;
            index.ordered.push(FieldEntry {
                index: idx,
                field_type: field_type.clone(),
                value: row.value,
                timestamp: row.timestamp,
            });
            // Last write wins; legacy data carries at most one row per
            // logical type once administrative fields are filtered.
            index.by_type.insert(field_type, index.ordered.len() - 1);
        }
        Ok(index)
    }

    #[must_use]
    pub fn lookup(&self, field_type: &str) -> Option<&FieldEntry> {
        self.by_type.get(&field_type.to_uppercase()).map(|pos| &self.ordered[*pos])
    }

    #[must_use]
    pub fn has(&self, field_type: &str) -> bool {
        self.lookup(field_type).is_some()
    }

    #[must_use]
    pub fn value(&self, field_type: &str) -> Option<&str> {
        self.lookup(field_type).map(|entry| entry.value.as_str())
    }

    /// Index of the field with the given type.
    ///
    /// # Errors
    /// Returns [`MigrationError::MissingField`] when the type is absent;
    /// callers are expected to check presence via [`Self::lookup`] first.
    pub fn index_of(&self, field_type: &str) -> Result<u32, MigrationError> {
        self.lookup(field_type)
            .map(|entry| entry.index)
            .ok_or_else(|| MigrationError::MissingField(field_type.to_uppercase()))
    }

    /// First entry among the ordered candidate type names, used for field
    /// names that exist under two historical spellings.
    #[must_use]
    pub fn first_present(&self, candidates: &[&str]) -> Option<&FieldEntry> {
        candidates.iter().find_map(|field_type| self.lookup(field_type))
    }

    #[must_use]
    pub fn entries(&self) -> &[FieldEntry] {
        &self.ordered
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChainEnd {
    ReachedOriginal,
    UnresolvedTarget,
}

/// Outcome of walking a replica-pointer chain back toward its original.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChainWalkResult {
    /// Last record in the chain whose existence was confirmed. For
    /// [`ChainEnd::ReachedOriginal`] this is the original record itself.
    pub origin: String,
    pub hops: u32,
    pub terminated: ChainEnd,
}

/// Strip whitespace and known resolution-URL prefixes from a pointer value.
#[must_use]
pub fn normalize_pointer(value: &str) -> &str {
    let trimmed = value.trim();
    for prefix in RESOLUTION_URL_PREFIXES {
        if let Some(bare) = trimmed.strip_prefix(prefix) {
            return bare;
        }
    }
    trimmed
}

/// Resolve the original record at the head of a replica-pointer chain.
///
/// The resolver is an injected capability returning the remote record's
/// fields, or `None` when the identifier does not resolve. A chain of
/// length k terminates with `hops == k`.
///
/// # Errors
/// Returns [`MigrationError::CycleGuard`] when the chain exceeds
/// [`MAX_CHAIN_HOPS`], or any error produced by the resolver itself.
pub fn walk<F>(
    start: &str,
    first_predecessor: &str,
    mut resolver: F,
) -> Result<ChainWalkResult, MigrationError>
where
    F: FnMut(&str) -> Result<Option<FieldIndex>, MigrationError>,
{
    let mut successor = start.to_string();
    let mut predecessor = first_predecessor.to_string();
    let mut hops = 0_u32;

    loop {
        hops += 1;
        if hops > MAX_CHAIN_HOPS {
            return Err(MigrationError::CycleGuard { last_predecessor: predecessor });
        }

        tracing::debug!(target = %predecessor, hop = hops, "resolving chain predecessor");
        let Some(record) = resolver(&predecessor)? else {
            tracing::warn!(
                handle = %successor,
                target = %predecessor,
                "predecessor pointer names a handle that does not resolve"
            );
            return Ok(ChainWalkResult {
                origin: successor,
                hops,
                terminated: ChainEnd::UnresolvedTarget,
            });
        };

        let Some(pointer) = record.first_present(&[TYPE_PPID_EUDAT, TYPE_PPID]) else {
            return Ok(ChainWalkResult {
                origin: predecessor,
                hops,
                terminated: ChainEnd::ReachedOriginal,
            });
        };

        let next = normalize_pointer(&pointer.value).to_string();
        if next.is_empty() {
            tracing::warn!(handle = %predecessor, "broken predecessor pointer value");
            return Ok(ChainWalkResult {
                origin: predecessor,
                hops,
                terminated: ChainEnd::UnresolvedTarget,
            });
        }

        successor = predecessor;
        predecessor = next;
    }
}

/// Policy for emitting the root-of-record field, resolving two divergent
/// historical behaviors of the original tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RorEmission {
    /// Reuse the existing ROR field's index via MODIFY; ADD at the fixed
    /// index only when no ROR field existed.
    ModifyInPlace,
    /// REMOVE any existing ROR field and ADD the new one at the fixed index.
    RemoveThenAdd,
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Literal written into `EUDAT/FIXED_CONTENT` for every record.
    pub fixed_content: bool,
    /// Enables the remote replica-chain traversal.
    pub remote_chain_walk: bool,
    /// Records whose URL contains any of these substrings share the legacy
    /// checksum convention but belong to an unrelated subsystem.
    pub unrelated_url_substrings: Vec<String>,
    pub ror_emission: RorEmission,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            fixed_content: false,
            remote_chain_walk: true,
            unrelated_url_substrings: default_unrelated_url_substrings(),
            ror_emission: RorEmission::ModifyInPlace,
        }
    }
}

#[must_use]
pub fn default_unrelated_url_substrings() -> Vec<String> {
    vec![
        "b2share.eudat.eu".to_string(),
        "trng-b2share.eudat.eu".to_string(),
        "eudat-b2share-test.csc.fi".to_string(),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldOp {
    pub index: u32,
    pub field_type: String,
    pub value: String,
}

impl FieldOp {
    fn new(index: u32, field_type: &str, value: impl Into<String>) -> Self {
        Self { index, field_type: field_type.to_string(), value: value.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOp {
    pub index: u32,
}

/// Ordered statement set for one record: REMOVE statements first, then one
/// MODIFY group, then one ADD group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordStatements {
    pub removals: Vec<RemoveOp>,
    pub modify_ops: Vec<FieldOp>,
    pub add_ops: Vec<FieldOp>,
}

impl RecordStatements {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.modify_ops.is_empty() && self.add_ops.is_empty()
    }
}

/// Decide eligibility and compute the statement set for one record.
///
/// An ineligible record yields an empty statement set; this silent skip is
/// what makes repeated runs idempotent. All remote I/O goes through the
/// injected resolver.
///
/// # Errors
/// Returns [`MigrationError::MalformedField`] when the checksum row lacks a
/// stored timestamp, [`MigrationError::LocationList`] when the location
/// list cannot be parsed, or a resolver error surfaced by the chain walk.
pub fn transform<F>(
    identifier: &str,
    record: &FieldIndex,
    config: &MigrationConfig,
    mut resolver: F,
) -> Result<RecordStatements, MigrationError>
where
    F: FnMut(&str) -> Result<Option<FieldIndex>, MigrationError>,
{
    let mut statements = RecordStatements::default();

    if !is_eligible(record, config) {
        return Ok(statements);
    }

    let checksum = record
        .lookup(TYPE_CHECKSUM)
        .ok_or_else(|| MigrationError::MissingField(TYPE_CHECKSUM.to_string()))?;

    // The checksum value moves to its new name at the same index.
    statements.modify_ops.push(FieldOp::new(
        checksum.index,
        TYPE_NEW_CHECKSUM,
        checksum.value.clone(),
    ));

    let timestamp = checksum.timestamp.ok_or_else(|| {
        MigrationError::MalformedField(format!(
            "checksum field of {identifier} carries no stored timestamp"
        ))
    })?;
    statements.add_ops.push(FieldOp::new(
        INDEX_CHECKSUM_TIMESTAMP,
        TYPE_NEW_CHECKSUM_TIMESTAMP,
        iso_timestamp(timestamp)?,
    ));

    let fixed_content = if config.fixed_content { "TRUE" } else { "FALSE" };
    statements.add_ops.push(FieldOp::new(INDEX_FIXED_CONTENT, TYPE_NEW_FIXED_CONTENT, fixed_content));

    apply_lineage_rules(identifier, record, config, &mut resolver, &mut statements)?;
    reencode_location_list(identifier, record, &mut statements)?;

    // Marks the record as migrated; drives the eligibility skip next run.
    statements.add_ops.push(FieldOp::new(INDEX_PROFILE_VERSION, TYPE_PROFILE_VERSION, "1"));

    Ok(statements)
}

fn is_eligible(record: &FieldIndex, config: &MigrationConfig) -> bool {
    if record.value(TYPE_PROFILE_VERSION) == Some("1") {
        return false;
    }
    if !record.has(TYPE_CHECKSUM) {
        return false;
    }
    // Records of unrelated subsystems share the checksum convention; an
    // absent URL field simply is not filtered.
    if let Some(url) = record.value(TYPE_URL) {
        if config.unrelated_url_substrings.iter().any(|needle| url.contains(needle)) {
            return false;
        }
    }
    true
}

/// Replica/original branch: resolve lineage and emit ROR/FIO/PARENT, or
/// fall back to original-record handling.
fn apply_lineage_rules<F>(
    identifier: &str,
    record: &FieldIndex,
    config: &MigrationConfig,
    resolver: &mut F,
    statements: &mut RecordStatements,
) -> Result<(), MigrationError>
where
    F: FnMut(&str) -> Result<Option<FieldIndex>, MigrationError>,
{
    let explicit_ror = record
        .first_present(&[TYPE_ROR_EUDAT, TYPE_ROR])
        .filter(|entry| !entry.value.trim().is_empty());
    let pointer = record.first_present(&[TYPE_PPID_EUDAT, TYPE_PPID]);

    if config.remote_chain_walk {
        if let Some(pointer) = pointer {
            match walk(identifier, &pointer.value, &mut *resolver) {
                Ok(result) if result.terminated == ChainEnd::ReachedOriginal => {
                    let ror_value = explicit_ror
                        .map_or_else(|| result.origin.clone(), |entry| entry.value.clone());
                    emit_ror(record, &ror_value, config.ror_emission, statements);
                    statements.add_ops.push(FieldOp::new(
                        INDEX_FIO,
                        TYPE_NEW_FIO,
                        result.origin,
                    ));
                    statements.modify_ops.push(FieldOp::new(
                        pointer.index,
                        TYPE_NEW_PARENT,
                        pointer.value.clone(),
                    ));
                    return Ok(());
                }
                Ok(result) => {
                    tracing::warn!(
                        handle = %identifier,
                        last_confirmed = %result.origin,
                        hops = result.hops,
                        "replica chain did not reach an original; treating record as original"
                    );
                }
                Err(MigrationError::CycleGuard { last_predecessor }) => {
                    tracing::warn!(
                        handle = %identifier,
                        last_predecessor = %last_predecessor,
                        "replica chain tripped the cycle guard; treating record as original"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    // Original record: an FIO field makes no sense here, and an absent or
    // empty ROR stays absent.
    if let Some(entry) = explicit_ror {
        let value = entry.value.clone();
        emit_ror(record, &value, config.ror_emission, statements);
    }
    Ok(())
}

fn emit_ror(
    record: &FieldIndex,
    value: &str,
    policy: RorEmission,
    statements: &mut RecordStatements,
) {
    let existing = record.first_present(&[TYPE_ROR_EUDAT, TYPE_ROR]);
    match policy {
        RorEmission::ModifyInPlace => match existing {
            Some(entry) => {
                statements.modify_ops.push(FieldOp::new(entry.index, TYPE_NEW_ROR, value));
            }
            None => statements.add_ops.push(FieldOp::new(INDEX_ROR, TYPE_NEW_ROR, value)),
        },
        RorEmission::RemoveThenAdd => {
            if let Some(entry) = existing {
                statements.removals.push(RemoveOp { index: entry.index });
            }
            statements.add_ops.push(FieldOp::new(INDEX_ROR, TYPE_NEW_ROR, value));
        }
    }
}

/// Re-encode the `10320/LOC` XML location list as a comma-joined replica
/// field, or remove it when only the primary location remains.
fn reencode_location_list(
    identifier: &str,
    record: &FieldIndex,
    statements: &mut RecordStatements,
) -> Result<(), MigrationError> {
    let Some(entry) = record.lookup(TYPE_LOCATION_LIST) else {
        return Ok(());
    };

    let document = roxmltree::Document::parse(&entry.value)
        .map_err(|err| MigrationError::LocationList(err.to_string()))?;

    let mut locations: BTreeMap<i64, String> = BTreeMap::new();
    for node in document.root_element().children().filter(|node| node.has_tag_name("location")) {
        let id = node
            .attribute("id")
            .ok_or_else(|| MigrationError::LocationList("location without id".to_string()))?
            .parse::<i64>()
            .map_err(|err| MigrationError::LocationList(format!("bad location id: {err}")))?;
        let href = node
            .attribute("href")
            .ok_or_else(|| MigrationError::LocationList("location without href".to_string()))?;
        locations.insert(id, href.to_string());
    }

    // Entry 0 is the record's primary location; it should mirror the URL
    // field and is dropped from the replica list either way.
    let primary = locations.remove(&0);
    if primary.as_deref() != record.value(TYPE_URL) {
        tracing::warn!(
            handle = %identifier,
            "location list entry 0 does not match the record's URL value"
        );
    }

    if locations.is_empty() {
        statements.removals.push(RemoveOp { index: entry.index });
    } else {
        let joined = locations.into_values().collect::<Vec<_>>().join(",");
        statements.modify_ops.push(FieldOp::new(entry.index, TYPE_NEW_REPLICA, joined));
    }
    Ok(())
}

fn iso_timestamp(epoch_seconds: i64) -> Result<String, MigrationError> {
    let moment = OffsetDateTime::from_unix_timestamp(epoch_seconds).map_err(|err| {
        MigrationError::MalformedField(format!(
            "checksum timestamp {epoch_seconds} is out of range: {err}"
        ))
    })?;
    moment.format(&time::format_description::well_known::Rfc3339).map_err(|err| {
        MigrationError::MalformedField(format!(
            "checksum timestamp {epoch_seconds} cannot be formatted: {err}"
        ))
    })
}

/// Serializes ordered statement groups plus an authentication preamble into
/// the batch artifact consumed by the external update agent.
///
/// Generic over the sink so tests drive it with a `Vec<u8>`; the driver
/// wraps a buffered file whose flush-on-drop keeps a partially written
/// batch a parseable prefix even when iteration aborts.
#[derive(Debug)]
pub struct BatchWriter<W: Write> {
    writer: W,
}

impl<W: Write> BatchWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// # Errors
    /// Propagates write failures from the underlying sink.
    pub fn write_auth_pubkey(&mut self, principal: &str, key_file: &str) -> io::Result<()> {
        writeln!(self.writer, "AUTHENTICATE PUBKEY:{principal}")?;
        writeln!(self.writer, "{key_file}")
    }

    /// # Errors
    /// Propagates write failures from the underlying sink.
    pub fn write_auth_seckey(&mut self, principal: &str, secret: &str) -> io::Result<()> {
        writeln!(self.writer, "AUTHENTICATE SECKEY:{principal}")?;
        writeln!(self.writer, "{secret}")
    }

    /// Write one record's block; a record with no statements writes nothing.
    ///
    /// # Errors
    /// Propagates write failures from the underlying sink.
    pub fn write_record_block(
        &mut self,
        identifier: &str,
        statements: &RecordStatements,
    ) -> io::Result<()> {
        if statements.is_empty() {
            return Ok(());
        }

        for removal in &statements.removals {
            writeln!(self.writer, "REMOVE {}:{identifier}", removal.index)?;
        }
        if !statements.modify_ops.is_empty() {
            writeln!(self.writer, "MODIFY {identifier}")?;
            for op in &statements.modify_ops {
                self.write_field_op(op)?;
            }
            writeln!(self.writer)?;
        }
        if !statements.add_ops.is_empty() {
            writeln!(self.writer, "ADD {identifier}")?;
            for op in &statements.add_ops {
                self.write_field_op(op)?;
            }
            writeln!(self.writer)?;
        }
        writeln!(self.writer)
    }

    fn write_field_op(&mut self, op: &FieldOp) -> io::Result<()> {
        writeln!(
            self.writer,
            "{} {} {LEASE_SECONDS} {PERMISSION_CODE} UTF8 {}",
            op.index, op.field_type, op.value
        )
    }

    /// Flush and hand back the sink.
    ///
    /// # Errors
    /// Propagates the final flush failure.
    pub fn finish(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

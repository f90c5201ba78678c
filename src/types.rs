//! # Domain Types for Rollcall
//!
//! This module defines the types that flow through the attendance core:
//! identifiers, the roster snapshot, the attendance event itself, the ledger
//! row it is persisted as, and the results handed back to callers.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Participant and operator identifiers are both strings, and swapping them is
//! exactly the kind of bug that goes unnoticed until the ledger is audited.
//! Wrapping each in its own type makes `confirm(operator, participant)` fail to
//! compile instead.
//!
//! ## Invariants
//!
//! - An [`AttendanceEvent`] is created once and never mutated
//! - It carries a *snapshot* of roster attributes, so a ledger row stays
//!   self-contained even if the roster changes later
//! - [`RecordedAt`] is always `YYYY-MM-DD HH:MM:SS` in the venue's fixed zone

use std::collections::BTreeMap;
use std::fmt;

use chrono::{FixedOffset, NaiveDateTime, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// `strftime` format of [`RecordedAt`].
pub const RECORDED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fixed column order of a ledger row.
///
/// The ledger is an external, append-only sheet. Its first row is a header
/// with these names; every following row is one [`AttendanceEvent`].
pub const LEDGER_COLUMNS: [&str; 6] = [
    "participant_id",
    "display_name",
    "group",
    "subgroup",
    "recorded_by",
    "recorded_at",
];

// =============================================================================
// Identifiers
// =============================================================================

/// Stable identity key of a participant (the value printed on a badge).
///
/// # Example
///
/// ```rust
/// use rollcall::types::ParticipantId;
///
/// let id = ParticipantId::new("D100");
/// assert_eq!(id.as_str(), "D100");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Creates a participant ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the ID is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of the operator who confirmed a check-in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorId(String);

impl OperatorId {
    /// Creates an operator ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the ID is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for OperatorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Roster Snapshot
// =============================================================================

/// Display attributes of a participant, as read from the roster.
///
/// # Accepted Field Names
///
/// Roster files in the wild use the conference vocabulary, so the serde
/// aliases accept both spellings:
///
/// | Field | Aliases |
/// |-------|---------|
/// | `display_name` | `name` |
/// | `group` | `committee` |
/// | `subgroup` | `portfolio` |
///
/// Any other attribute in the file (country, form status, ...) is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    /// Name shown to the operator and written to the ledger.
    #[serde(alias = "name")]
    pub display_name: String,

    /// Primary grouping (e.g. committee).
    #[serde(alias = "committee")]
    pub group: String,

    /// Optional secondary grouping (e.g. portfolio).
    #[serde(default, alias = "portfolio", deserialize_with = "blank_as_none")]
    pub subgroup: Option<String>,
}

impl ParticipantProfile {
    /// Creates a profile without a subgroup.
    pub fn new(display_name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            group: group.into(),
            subgroup: None,
        }
    }

    /// Sets the subgroup. Blank strings are treated as "no subgroup".
    pub fn with_subgroup(mut self, subgroup: impl Into<String>) -> Self {
        let subgroup = subgroup.into();
        self.subgroup = (!subgroup.trim().is_empty()).then_some(subgroup);
        self
    }
}

fn blank_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

// =============================================================================
// Timestamps
// =============================================================================

/// Wall-clock time a check-in was recorded, in the venue's time zone.
///
/// Stored as the formatted string rather than a parsed instant because the
/// ledger is a human-facing sheet and the string is what gets written there.
/// Construction always validates the format, so every `RecordedAt` in the
/// system parses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordedAt(String);

impl RecordedAt {
    /// Parses and validates a `YYYY-MM-DD HH:MM:SS` timestamp.
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        NaiveDateTime::parse_from_str(&value, RECORDED_AT_FORMAT).map_err(|e| {
            Error::InvalidRecord(format!("recorded_at '{value}' is not {RECORDED_AT_FORMAT}: {e}"))
        })?;
        Ok(Self(value))
    }

    /// Returns the formatted timestamp.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordedAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for RecordedAt {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<RecordedAt> for String {
    fn from(value: RecordedAt) -> Self {
        value.0
    }
}

/// Clock pinned to the venue's fixed UTC offset.
///
/// All operators' devices may sit in different zones (or have drifting
/// clocks); the timestamp is taken by the process that admits the event and
/// normalized to one offset so the ledger sorts sensibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VenueClock {
    offset: FixedOffset,
}

impl VenueClock {
    /// A clock reporting UTC.
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// A clock at `minutes` east of UTC (negative for west).
    ///
    /// # Errors
    ///
    /// `Error::Config` if the offset is a day or more.
    pub fn from_offset_minutes(minutes: i32) -> Result<Self> {
        let offset = minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| Error::Config(format!("utc offset of {minutes} minutes is out of range")))?;
        Ok(Self { offset })
    }

    /// The configured offset.
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Current time at the venue.
    pub fn now(&self) -> RecordedAt {
        let formatted = Utc::now()
            .with_timezone(&self.offset)
            .format(RECORDED_AT_FORMAT)
            .to_string();
        RecordedAt(formatted)
    }
}

impl Default for VenueClock {
    fn default() -> Self {
        Self::utc()
    }
}

// =============================================================================
// Attendance Event
// =============================================================================

/// One confirmed check-in.
///
/// # Lifecycle
///
/// Created the instant a check-in is confirmed for a participant who has no
/// event yet, then never mutated. The same value lives in the fast cache
/// (visible immediately) and in the pending queue until the flusher moves it
/// to the ledger.
///
/// # Wire Format
///
/// Serializes as a flat record with exactly the six ledger fields. Whether an
/// event is still queued is not part of the record; callers derive it from
/// pending queue membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub group: String,
    #[serde(default)]
    pub subgroup: Option<String>,
    pub recorded_by: OperatorId,
    pub recorded_at: RecordedAt,
}

impl AttendanceEvent {
    /// Builds an event from a roster snapshot.
    pub fn new(
        participant_id: ParticipantId,
        profile: &ParticipantProfile,
        recorded_by: OperatorId,
        recorded_at: RecordedAt,
    ) -> Self {
        Self {
            participant_id,
            display_name: profile.display_name.clone(),
            group: profile.group.clone(),
            subgroup: profile.subgroup.clone(),
            recorded_by,
            recorded_at,
        }
    }

    /// Converts to a ledger row in [`LEDGER_COLUMNS`] order.
    ///
    /// A missing subgroup becomes an empty cell.
    pub fn to_row(&self) -> LedgerRow {
        LedgerRow::new(vec![
            self.participant_id.as_str().to_string(),
            self.display_name.clone(),
            self.group.clone(),
            self.subgroup.clone().unwrap_or_default(),
            self.recorded_by.as_str().to_string(),
            self.recorded_at.as_str().to_string(),
        ])
    }

    /// Parses a ledger row back into an event.
    ///
    /// # Errors
    ///
    /// `Error::InvalidRecord` if the row does not have exactly six cells, the
    /// participant ID or operator is blank, or the timestamp does not parse.
    pub fn from_row(row: &LedgerRow) -> Result<Self> {
        let [participant_id, display_name, group, subgroup, recorded_by, recorded_at] =
            row.cells()
        else {
            return Err(Error::InvalidRecord(format!(
                "ledger row has {} columns, expected {}",
                row.cells().len(),
                LEDGER_COLUMNS.len()
            )));
        };

        let participant_id = ParticipantId::new(participant_id.trim());
        if participant_id.is_blank() {
            return Err(Error::InvalidRecord("ledger row has an empty participant_id".into()));
        }

        let recorded_by = OperatorId::new(recorded_by.trim());
        if recorded_by.is_blank() {
            return Err(Error::InvalidRecord(format!(
                "ledger row for '{participant_id}' has an empty recorded_by"
            )));
        }

        Ok(Self {
            participant_id,
            display_name: display_name.clone(),
            group: group.clone(),
            subgroup: (!subgroup.trim().is_empty()).then(|| subgroup.clone()),
            recorded_by,
            recorded_at: RecordedAt::parse(recorded_at.trim())?,
        })
    }

    /// Serializes to the flat JSON wire format used by key-value stores.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses the flat JSON wire format.
    pub fn from_wire(wire: &str) -> Result<Self> {
        Ok(serde_json::from_str(wire)?)
    }
}

// =============================================================================
// Ledger Row
// =============================================================================

/// One row of the ledger, as raw cells.
///
/// Rows read back from the ledger are not trusted: the sheet may have been
/// edited by hand. Parsing into an [`AttendanceEvent`] is a separate,
/// fallible step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    cells: Vec<String>,
}

impl LedgerRow {
    /// Creates a row from raw cells.
    pub fn new(cells: Vec<String>) -> Self {
        Self { cells }
    }

    /// The header row ([`LEDGER_COLUMNS`]).
    pub fn header() -> Self {
        Self::new(LEDGER_COLUMNS.iter().map(|c| c.to_string()).collect())
    }

    /// Returns true if this row is the header row.
    pub fn is_header(&self) -> bool {
        self.cells.len() == LEDGER_COLUMNS.len()
            && self
                .cells
                .iter()
                .zip(LEDGER_COLUMNS.iter())
                .all(|(cell, column)| cell.trim().eq_ignore_ascii_case(column))
    }

    /// The raw cells.
    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    /// Consumes the row, returning its cells.
    pub fn into_cells(self) -> Vec<String> {
        self.cells
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of an admission attempt.
///
/// `AlreadyPresent` is a first-class success, not an error: the scan was
/// valid, the participant simply checked in earlier. Both variants carry the
/// event that is (or will be) in the ledger, so every racing caller sees the
/// same `recorded_by` and `recorded_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// This call created the event.
    Admitted(AttendanceEvent),

    /// An earlier call created the event; nothing was changed.
    AlreadyPresent(AttendanceEvent),
}

impl Admission {
    /// The winning event.
    pub fn event(&self) -> &AttendanceEvent {
        match self {
            Admission::Admitted(event) | Admission::AlreadyPresent(event) => event,
        }
    }

    /// Consumes the admission, returning the winning event.
    pub fn into_event(self) -> AttendanceEvent {
        match self {
            Admission::Admitted(event) | Admission::AlreadyPresent(event) => event,
        }
    }

    /// Returns true if this call created the event.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Result of looking a participant up before confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// The participant's event, if already checked in.
    pub event: Option<AttendanceEvent>,

    /// Convenience flag, equal to `event.is_some()`.
    pub already_present: bool,
}

impl CheckOutcome {
    pub fn from_event(event: Option<AttendanceEvent>) -> Self {
        Self {
            already_present: event.is_some(),
            event,
        }
    }
}

/// Sizes of the shared structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Stats {
    /// Participants visible as checked in.
    pub cached_count: usize,

    /// Events not yet written to the ledger.
    pub pending_count: usize,
}

/// Attendance overview for the event dashboard.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AttendanceSummary {
    /// Participants on the roster.
    pub registered: usize,

    /// Number of participants checked in.
    pub total_present: usize,

    /// `total_present / registered`, or 0 with an empty roster.
    pub attendance_rate: f64,

    /// Check-ins per recording operator.
    pub by_operator: BTreeMap<String, usize>,

    /// Checked-in participant IDs, sorted.
    pub present_ids: Vec<ParticipantId>,
}

impl AttendanceSummary {
    /// Aggregates a set of events (one per participant) against a roster of
    /// `registered` participants.
    pub fn from_events<'a>(
        events: impl IntoIterator<Item = &'a AttendanceEvent>,
        registered: usize,
    ) -> Self {
        let mut summary = Self {
            registered,
            ..Self::default()
        };

        for event in events {
            summary.total_present += 1;
            *summary
                .by_operator
                .entry(event.recorded_by.as_str().to_string())
                .or_insert(0) += 1;
            summary.present_ids.push(event.participant_id.clone());
        }

        summary.present_ids.sort();
        if registered > 0 {
            summary.attendance_rate = summary.total_present as f64 / registered as f64;
        }
        summary
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> AttendanceEvent {
        AttendanceEvent::new(
            ParticipantId::new("D100"),
            &ParticipantProfile::new("Ada Lovelace", "UNSC").with_subgroup("France"),
            OperatorId::new("OC7"),
            RecordedAt::parse("2025-03-14 09:26:53").unwrap(),
        )
    }

    #[test]
    fn test_recorded_at_validation() {
        assert!(RecordedAt::parse("2025-03-14 09:26:53").is_ok());
        assert!(RecordedAt::parse("2025-03-14T09:26:53").is_err());
        assert!(RecordedAt::parse("Fri Mar 14 09:26:53 2025").is_err());
        assert!(RecordedAt::parse("").is_err());
    }

    #[test]
    fn test_venue_clock_produces_parseable_timestamps() {
        let clock = VenueClock::from_offset_minutes(330).unwrap();
        let now = clock.now();

        assert!(RecordedAt::parse(now.as_str()).is_ok());
        assert_eq!(clock.offset().local_minus_utc(), 330 * 60);
    }

    #[test]
    fn test_venue_clock_rejects_out_of_range_offset() {
        assert!(matches!(
            VenueClock::from_offset_minutes(24 * 60),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_row_uses_fixed_column_order() {
        let row = sample_event().to_row();
        assert_eq!(
            row.cells(),
            &["D100", "Ada Lovelace", "UNSC", "France", "OC7", "2025-03-14 09:26:53"]
        );
    }

    #[test]
    fn test_missing_subgroup_is_an_empty_cell() {
        let mut event = sample_event();
        event.subgroup = None;

        let row = event.to_row();
        assert_eq!(row.cells()[3], "");

        let parsed = AttendanceEvent::from_row(&row).unwrap();
        assert_eq!(parsed.subgroup, None);
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_from_row_rejects_malformed_rows() {
        let short = LedgerRow::new(vec!["D1".into(), "Name".into()]);
        assert!(matches!(
            AttendanceEvent::from_row(&short),
            Err(Error::InvalidRecord(_))
        ));

        let mut cells = sample_event().to_row().into_cells();
        cells[5] = "yesterday".into();
        assert!(AttendanceEvent::from_row(&LedgerRow::new(cells)).is_err());

        let mut cells = sample_event().to_row().into_cells();
        cells[0] = "   ".into();
        assert!(AttendanceEvent::from_row(&LedgerRow::new(cells)).is_err());
    }

    #[test]
    fn test_header_detection() {
        assert!(LedgerRow::header().is_header());
        assert!(!sample_event().to_row().is_header());
    }

    #[test]
    fn test_wire_format_is_flat() {
        let wire = sample_event().to_wire().unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();

        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 6);
        assert_eq!(object["participant_id"], "D100");
        assert_eq!(object["recorded_by"], "OC7");
        assert_eq!(object["recorded_at"], "2025-03-14 09:26:53");
        assert!(!object.contains_key("status"));

        assert_eq!(AttendanceEvent::from_wire(&wire).unwrap(), sample_event());
    }

    #[test]
    fn test_wire_format_rejects_bad_timestamp() {
        let wire = r#"{"participant_id":"D1","display_name":"A","group":"G","subgroup":null,
                       "recorded_by":"OC1","recorded_at":"not a time"}"#;
        assert!(AttendanceEvent::from_wire(wire).is_err());
    }

    #[test]
    fn test_profile_aliases_and_blank_subgroup() {
        let profile: ParticipantProfile = serde_json::from_str(
            r#"{"name":"Grace","committee":"DISEC","portfolio":"","country":"Peru"}"#,
        )
        .unwrap();

        assert_eq!(profile.display_name, "Grace");
        assert_eq!(profile.group, "DISEC");
        assert_eq!(profile.subgroup, None);
    }

    #[test]
    fn test_summary_counts_by_operator() {
        let a = sample_event();
        let mut b = sample_event();
        b.participant_id = ParticipantId::new("D050");
        let mut c = sample_event();
        c.participant_id = ParticipantId::new("D200");
        c.recorded_by = OperatorId::new("OC9");

        let summary = AttendanceSummary::from_events([&a, &b, &c], 4);

        assert_eq!(summary.registered, 4);
        assert_eq!(summary.total_present, 3);
        assert_eq!(summary.attendance_rate, 0.75);
        assert_eq!(summary.by_operator["OC7"], 2);
        assert_eq!(summary.by_operator["OC9"], 1);
        assert_eq!(
            summary.present_ids,
            vec![
                ParticipantId::new("D050"),
                ParticipantId::new("D100"),
                ParticipantId::new("D200")
            ]
        );
    }

    #[test]
    fn test_summary_with_empty_roster() {
        let summary = AttendanceSummary::from_events(std::iter::empty::<&AttendanceEvent>(), 0);

        assert_eq!(summary.registered, 0);
        assert_eq!(summary.total_present, 0);
        assert_eq!(summary.attendance_rate, 0.0);
    }

    #[test]
    fn test_admission_accessors() {
        let admitted = Admission::Admitted(sample_event());
        let present = Admission::AlreadyPresent(sample_event());

        assert!(admitted.is_admitted());
        assert!(!present.is_admitted());
        assert_eq!(admitted.event(), present.event());
    }
}

//! Validation and reshaping of raw inventory records.

use crate::types::{now_millis, HostRecord, RecordSource, VmRecord, VmState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Tag holding a comma separated list of discovery groups.
pub const GROUPS_TAG: &str = "cmon_groups";
/// Tag naming the role of an operator-managed zone.
pub const ROLE_TAG: &str = "smartdc_role";
/// Tag set to `core` on operator-managed zones.
pub const TYPE_TAG: &str = "smartdc_type";
/// Role of NAT gateway zones, which are never cached.
pub const NAT_ROLE: &str = "nat";

/// Change notification from the live feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    pub changed_resource_id: String,
    #[serde(default)]
    pub change_kind: Option<Value>,
}

impl ChangeNotice {
    pub fn new(vm_uuid: impl Into<String>) -> Self {
        Self { changed_resource_id: vm_uuid.into(), change_kind: None }
    }
}

/// One unit of work for the cache update pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// Full VM record from the bootstrap listing.
    Bootstrap(Value),
    /// A VM changed; only its id is known.
    Change(ChangeNotice),
    /// Full host record from the host directory poll.
    Poll(Value),
}

impl CacheEvent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Bootstrap(_) => "bootstrap",
            Self::Change(_) => "changefeed",
            Self::Poll(_) => "poll",
        }
    }
}

/// Reason a raw record could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("record is not an object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be {expected}")]
    WrongType { field: &'static str, expected: &'static str },

    #[error("record rejected: {0}")]
    Rejected(String),
}

/// State recorded for VMs the inventory reports without one.
pub const UNKNOWN_STATE: &str = "unknown";

/// Turn a raw inventory VM into a cache record.
pub fn normalize_vm(raw: &Value, source: RecordSource) -> Result<VmRecord, NormalizeError> {
    let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;

    let vm_uuid = required_str(obj, "uuid")?;
    let server_uuid = required_str(obj, "server_uuid")?;
    let owner_uuid = required_str(obj, "owner_uuid")?;
    // No state means nothing to route to.
    let state = optional_str(obj, "state")?.unwrap_or_else(|| UNKNOWN_STATE.to_string());

    let tags = match obj.get("tags") {
        None | Some(Value::Null) => None,
        Some(Value::Object(tags)) => Some(tags),
        Some(_) => return Err(NormalizeError::WrongType { field: "tags", expected: "an object" }),
    };

    let role = tags
        .and_then(|t| t.get(ROLE_TAG))
        .and_then(|r| r.as_str())
        .filter(|r| !r.is_empty());

    if role == Some(NAT_ROLE) {
        return Err(NormalizeError::Rejected(format!("{} is a NAT zone", vm_uuid)));
    }

    let core_type = tags.and_then(|t| t.get(TYPE_TAG)).and_then(|t| t.as_str()) == Some("core");

    let groups = tags
        .and_then(|t| t.get(GROUPS_TAG))
        .and_then(|g| g.as_str())
        .map(parse_groups)
        .unwrap_or_default();

    Ok(VmRecord {
        vm_uuid,
        server_uuid,
        owner_uuid,
        alias: optional_str(obj, "alias")?,
        brand: optional_str(obj, "brand")?,
        image_uuid: optional_str(obj, "image_uuid")?,
        state: VmState::from(state),
        groups,
        affinity_group: role.map(str::to_string),
        core: role.is_some() || core_type,
        source,
        cached_date: now_millis(),
    })
}

/// Turn a raw host directory entry into a host record.
pub fn normalize_host(raw: &Value) -> Result<HostRecord, NormalizeError> {
    let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;

    let uuid = required_str(obj, "uuid")?;
    let hostname = optional_str(obj, "hostname")?;
    let setup = match obj.get("setup") {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => return Err(NormalizeError::WrongType { field: "setup", expected: "a boolean" }),
    };
    let sysinfo = match obj.get("sysinfo") {
        None | Some(Value::Null) => None,
        Some(v) if v.is_object() => Some(v.clone()),
        Some(_) => {
            return Err(NormalizeError::WrongType { field: "sysinfo", expected: "an object" })
        }
    };

    Ok(HostRecord { uuid, hostname, setup, sysinfo })
}

/// Split a group tag, trimming pieces and dropping empty ones.
pub fn parse_groups(tag: &str) -> Vec<String> {
    tag.split(',').map(str::trim).filter(|g| !g.is_empty()).map(str::to_string).collect()
}

fn required_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, NormalizeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(NormalizeError::MissingField(field)),
        Some(Value::String(s)) if s.is_empty() => Err(NormalizeError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(NormalizeError::WrongType { field, expected: "a string" }),
    }
}

fn optional_str(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, NormalizeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(NormalizeError::WrongType { field, expected: "a string" }),
    }
}

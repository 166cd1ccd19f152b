//! Peer directory: mesh peer descriptors and the registry keyed by uuid.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde_json::{Map, Number, Value};

use crate::error::BridgeError;

/// Port advertised by a peer that does not announce one.
pub const DEFAULT_PEER_PORT: u16 = 80;

/// A single value of the open-ended [`PeerInfos::extra`] mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtraValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Anything else JSON can carry (lists, maps, null).
    Json(Value),
}

impl ExtraValue {
    /// Convert to a JSON value. Non-finite floats have no JSON
    /// representation and are rejected instead of being turned into `null`.
    pub fn to_json(&self, key: &str) -> Result<Value, BridgeError> {
        match self {
            Self::Str(s) => Ok(Value::String(s.clone())),
            Self::Int(i) => Ok(Value::from(*i)),
            Self::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .ok_or_else(|| BridgeError::NonSerializable {
                    key: key.to_string(),
                }),
            Self::Bool(b) => Ok(Value::Bool(*b)),
            Self::Json(v) => Ok(v.clone()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Value> for ExtraValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Self::Str(s),
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if n.is_f64() {
                    Self::Float(n.as_f64().unwrap_or_default())
                } else {
                    // u64 beyond i64::MAX
                    Self::Json(Value::Number(n))
                }
            }
            other => Self::Json(other),
        }
    }
}

impl From<&str> for ExtraValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<bool> for ExtraValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ExtraValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ExtraValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Everything known about one mesh peer.
///
/// `uuid` is supplied by the peer and survives reconnections, while `ident`
/// is assigned by the mesh bus and may change every time the peer joins.
/// MAC addresses are kept to recognize a reinstalled peer that lost its uuid.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfos {
    pub uuid: Option<String>,
    pub ident: Option<String>,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub port: u16,
    pub ssl: bool,
    pub auth: bool,
    pub macs: Vec<String>,
    /// Set on other bridge instances, never on device peers.
    pub cleepdesktop: bool,
    pub online: bool,
    /// Vendor and application specific metadata.
    pub extra: BTreeMap<String, ExtraValue>,
}

impl Default for PeerInfos {
    fn default() -> Self {
        Self {
            uuid: None,
            ident: None,
            hostname: None,
            ip: None,
            port: DEFAULT_PEER_PORT,
            ssl: false,
            auth: false,
            macs: Vec::new(),
            cleepdesktop: false,
            online: false,
            extra: BTreeMap::new(),
        }
    }
}

impl PeerInfos {
    /// Serialize to a JSON object.
    pub fn to_dict(&self) -> Result<Value, BridgeError> {
        let mut extra = Map::new();
        for (key, value) in &self.extra {
            extra.insert(key.clone(), value.to_json(key)?);
        }

        Ok(serde_json::json!({
            "uuid": self.uuid,
            "ident": self.ident,
            "hostname": self.hostname,
            "ip": self.ip,
            "port": self.port,
            "ssl": self.ssl,
            "auth": self.auth,
            "macs": self.macs,
            "cleepdesktop": self.cleepdesktop,
            "online": self.online,
            "extra": extra,
        }))
    }

    /// Build a record from a JSON object produced by [`to_dict`](Self::to_dict).
    pub fn from_dict(dict: &Value) -> Result<Self, BridgeError> {
        let mut infos = Self::default();
        infos.fill_from_dict(dict)?;
        Ok(infos)
    }

    /// Overwrite every field from a JSON object. Missing keys reset the
    /// field to its default.
    pub fn fill_from_dict(&mut self, dict: &Value) -> Result<(), BridgeError> {
        let obj = dict
            .as_object()
            .ok_or_else(|| BridgeError::InvalidMessage("peer_infos must be a dict".into()))?;

        let string_field =
            |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        let bool_field = |key: &str| obj.get(key).and_then(Value::as_bool).unwrap_or(false);

        self.uuid = string_field("uuid");
        self.ident = string_field("ident");
        self.hostname = string_field("hostname");
        self.ip = string_field("ip");
        self.port = obj
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_PEER_PORT);
        self.ssl = bool_field("ssl");
        self.auth = bool_field("auth");
        self.macs = obj
            .get("macs")
            .and_then(Value::as_array)
            .map(|macs| {
                macs.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.cleepdesktop = bool_field("cleepdesktop");
        self.online = bool_field("online");
        self.extra = obj
            .get("extra")
            .and_then(Value::as_object)
            .map(|extra| {
                extra
                    .iter()
                    .map(|(k, v)| (k.clone(), ExtraValue::from(v.clone())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(())
    }

    fn shares_mac_with(&self, other: &PeerInfos) -> bool {
        self.macs.iter().any(|mac| other.macs.contains(mac))
    }
}

impl fmt::Display for PeerInfos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PeerInfos(uuid:{:?}, ident:{:?}, hostname:{:?}, ip:{:?}, port:{}, online:{})",
            self.uuid, self.ident, self.hostname, self.ip, self.port, self.online
        )
    }
}

/// Directory of every peer seen since startup, keyed by uuid.
///
/// Records are never removed on disconnect; they only flip to offline.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<String, PeerInfos>,
}

impl PeerDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Insert or replace the record for `infos.uuid`.
    ///
    /// Records of other uuids sharing a MAC address with the new record
    /// belong to the same device before a reinstall: they are removed and
    /// returned.
    pub fn upsert(&mut self, infos: PeerInfos) -> Result<Vec<PeerInfos>, BridgeError> {
        let uuid = infos
            .uuid
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| BridgeError::InvalidMessage("peer has no uuid".into()))?;

        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(key, peer)| **key != uuid && peer.shares_mac_with(&infos))
            .map(|(key, _)| key.clone())
            .collect();
        let replaced = stale
            .iter()
            .filter_map(|key| self.peers.remove(key))
            .collect();

        self.peers.insert(uuid, infos);
        Ok(replaced)
    }

    /// Get a peer by uuid.
    pub fn get(&self, uuid: &str) -> Option<&PeerInfos> {
        self.peers.get(uuid)
    }

    /// Get a peer by its current mesh bus identifier. An online record wins
    /// over an offline one carrying the same ident.
    pub fn get_by_ident(&self, ident: &str) -> Option<&PeerInfos> {
        let mut matching = self
            .peers
            .values()
            .filter(|p| p.ident.as_deref() == Some(ident));
        let first = matching.next()?;
        if first.online {
            return Some(first);
        }
        Some(matching.find(|p| p.online).unwrap_or(first))
    }

    /// Flip the peer with this ident offline and return its record.
    pub fn mark_offline(&mut self, ident: &str) -> Option<&PeerInfos> {
        let uuid = self.get_by_ident(ident)?.uuid.clone()?;
        let peer = self.peers.get_mut(&uuid)?;
        peer.online = false;
        Some(&*peer)
    }

    /// List all known peers regardless of state.
    pub fn list_all(&self) -> Vec<&PeerInfos> {
        self.peers.values().collect()
    }

    /// List peers currently online.
    pub fn list_online(&self) -> Vec<&PeerInfos> {
        self.peers.values().filter(|p| p.online).collect()
    }

    /// Return the number of online peers.
    pub fn online_count(&self) -> usize {
        self.peers.values().filter(|p| p.online).count()
    }

    /// Return the total number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

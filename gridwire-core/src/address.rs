//! Node identity types.
//!
//! - [`UID`]: 128-bit unique identifier handed out by the group substrate
//! - [`TopologyCoordinates`]: site / rack / machine placement of a node
//! - [`Address`]: a cluster member, identified by its UID

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// 128-bit unique identifier.
///
/// # Examples
///
/// ```
/// use gridwire_core::UID;
///
/// let uid = UID::new(0x123, 0x456);
/// assert!(uid.is_valid());
/// assert!(!UID::default().is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct UID {
    /// First 64 bits.
    pub first: u64,
    /// Second 64 bits.
    pub second: u64,
}

impl UID {
    /// Create a new UID with explicit values.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Check if UID is valid (non-zero).
    pub const fn is_valid(&self) -> bool {
        self.first != 0 || self.second != 0
    }
}

impl std::fmt::Display for UID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

/// Physical placement of a node, used by locality-aware policies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TopologyCoordinates {
    /// Site (datacenter) name.
    pub site: Option<String>,
    /// Rack name within the site.
    pub rack: Option<String>,
    /// Machine name within the rack.
    pub machine: Option<String>,
}

impl TopologyCoordinates {
    /// Create coordinates with all three levels set.
    pub fn new(
        site: impl Into<String>,
        rack: impl Into<String>,
        machine: impl Into<String>,
    ) -> Self {
        Self {
            site: Some(site.into()),
            rack: Some(rack.into()),
            machine: Some(machine.into()),
        }
    }

    /// Both nodes are known to live in the same site.
    pub fn is_same_site(&self, other: &TopologyCoordinates) -> bool {
        self.site.is_some() && self.site == other.site
    }

    /// Both nodes are known to live in the same rack of the same site.
    pub fn is_same_rack(&self, other: &TopologyCoordinates) -> bool {
        self.is_same_site(other) && self.rack.is_some() && self.rack == other.rack
    }

    /// Both nodes are known to live on the same machine.
    pub fn is_same_machine(&self, other: &TopologyCoordinates) -> bool {
        self.is_same_rack(other) && self.machine.is_some() && self.machine == other.machine
    }
}

/// Identity of a cluster member.
///
/// Two addresses are equal when their [`UID`]s are equal. The logical name and
/// the topology coordinates ride along for logging and placement decisions but
/// never participate in equality or hashing, so an address decoded from a bare
/// message header compares equal to the fully populated one from the view.
///
/// # Examples
///
/// ```
/// use gridwire_core::{Address, TopologyCoordinates, UID};
///
/// let bare = Address::new(UID::new(1, 7), "node-a");
/// let placed = bare.clone().with_topology(TopologyCoordinates::new("lon", "r1", "m1"));
///
/// assert_eq!(bare, placed);
/// assert_eq!(placed.site(), Some("lon"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    uid: UID,
    name: String,
    topology: Option<TopologyCoordinates>,
}

impl Address {
    /// Create an address without topology information.
    pub fn new(uid: UID, name: impl Into<String>) -> Self {
        Self {
            uid,
            name: name.into(),
            topology: None,
        }
    }

    /// Attach topology coordinates.
    pub fn with_topology(mut self, topology: TopologyCoordinates) -> Self {
        self.topology = Some(topology);
        self
    }

    /// The identity of this member.
    pub fn uid(&self) -> UID {
        self.uid
    }

    /// Logical node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topology coordinates, if the substrate is topology aware.
    pub fn topology(&self) -> Option<&TopologyCoordinates> {
        self.topology.as_ref()
    }

    /// Site this member belongs to, if known.
    pub fn site(&self) -> Option<&str> {
        self.topology.as_ref().and_then(|t| t.site.as_deref())
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.uid.cmp(&other.uid)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.uid)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

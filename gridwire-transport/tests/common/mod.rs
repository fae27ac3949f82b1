//! In-memory group substrate for integration tests.
//!
//! A [`LocalCluster`] connects several transports on one `LocalSet`. Every
//! send is recorded, then delivered on its own spawned task, so delivery is
//! asynchronous but FIFO for any pair of members.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use gridwire_transport::{
    Address, ChannelError, DeliverOrder, GroupChannel, GroupTransport, InboundInvocationHandler,
    JsonMarshaller, MessageFlags, ReplicableCommand, ReplyPromise, Response, TokioProviders,
    TopologyCoordinates, TransportConfig, UID, ViewEvent,
};
use serde::{Deserialize, Serialize};

/// Commands understood by [`KvHandler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvCommand {
    /// Reply with the member name.
    Whoami,
    /// Reply with the stored value, `Unsuccessful` when absent.
    Get { key: String },
    /// Store a value.
    Put { key: String, value: String },
    /// Record `tag` after `delay_ms`, then reply with it.
    Record { tag: u32, delay_ms: u64 },
    /// Reply with an execution failure.
    Fail { message: String },
    /// Drop the reply without answering.
    Forget,
    /// Like `Whoami`, but bypasses ordering chains.
    Ping,
}

impl ReplicableCommand for KvCommand {
    type Value = String;

    fn is_non_blocking(&self) -> bool {
        matches!(self, KvCommand::Ping)
    }

    fn name(&self) -> &'static str {
        match self {
            KvCommand::Whoami => "whoami",
            KvCommand::Get { .. } => "get",
            KvCommand::Put { .. } => "put",
            KvCommand::Record { .. } => "record",
            KvCommand::Fail { .. } => "fail",
            KvCommand::Forget => "forget",
            KvCommand::Ping => "ping",
        }
    }
}

/// Transport type used by every test.
pub type Node = GroupTransport<TokioProviders, JsonMarshaller, KvCommand>;

/// Application handler with a tiny key/value store.
pub struct KvHandler {
    name: String,
    store: RefCell<HashMap<String, String>>,
    records: RefCell<Vec<(String, u32)>>,
    handled: Cell<usize>,
}

impl KvHandler {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            store: RefCell::new(HashMap::new()),
            records: RefCell::new(Vec::new()),
            handled: Cell::new(0),
        }
    }

    /// Store a value locally.
    pub fn put(&self, key: &str, value: &str) {
        self.store.borrow_mut().insert(key.to_string(), value.to_string());
    }

    /// Locally stored value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.borrow().get(key).cloned()
    }

    /// Recorded tags, in execution order.
    pub fn tags(&self) -> Vec<u32> {
        self.records.borrow().iter().map(|(_, tag)| *tag).collect()
    }

    /// Recorded origins and tags, in execution order.
    pub fn records(&self) -> Vec<(String, u32)> {
        self.records.borrow().clone()
    }

    /// Number of commands handled.
    pub fn handled(&self) -> usize {
        self.handled.get()
    }
}

#[async_trait(?Send)]
impl InboundInvocationHandler<KvCommand> for KvHandler {
    async fn handle(
        &self,
        origin: Address,
        command: KvCommand,
        reply: ReplyPromise<String>,
        _order: DeliverOrder,
    ) {
        self.handled.set(self.handled.get() + 1);
        match command {
            KvCommand::Whoami | KvCommand::Ping => reply.send_value(self.name.clone()),
            KvCommand::Get { key } => match self.get(&key) {
                Some(value) => reply.send_value(value),
                None => reply.send(Response::Unsuccessful(None)),
            },
            KvCommand::Put { key, value } => {
                self.store.borrow_mut().insert(key, value);
                reply.send(Response::Success(None));
            }
            KvCommand::Record { tag, delay_ms } => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                self.records
                    .borrow_mut()
                    .push((origin.name().to_string(), tag));
                reply.send_value(tag.to_string());
            }
            KvCommand::Fail { message } => reply.send_error(message),
            KvCommand::Forget => drop(reply),
        }
    }
}

/// Where a recorded message was sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// One member.
    Member(Address),
    /// Every member of the sender's site.
    All,
    /// An explicit member list.
    Many(Vec<Address>),
    /// A remote site master.
    Site(String),
}

/// One message handed to the substrate.
#[derive(Debug, Clone)]
pub struct Sent {
    /// Sending member.
    pub from: Address,
    /// Destination.
    pub to: Target,
    /// Flags the message was sent with.
    pub flags: MessageFlags,
    /// Frame bytes.
    pub payload: Vec<u8>,
}

/// A started member with its handler.
#[derive(Clone)]
pub struct TestNode {
    /// The transport.
    pub transport: Rc<Node>,
    /// Its inbound handler.
    pub handler: Rc<KvHandler>,
    /// Its address.
    pub address: Address,
}

struct Member {
    address: Address,
    site: String,
    transport: Weak<Node>,
}

/// In-memory substrate shared by every node of a test.
#[derive(Default)]
pub struct LocalCluster {
    members: RefCell<Vec<Member>>,
    sent: RefCell<Vec<Sent>>,
    muted: RefCell<HashSet<Address>>,
    next_id: Cell<u64>,
    unicast_only: Cell<bool>,
}

struct LocalChannel {
    cluster: Rc<LocalCluster>,
    address: Address,
}

impl GroupChannel for LocalChannel {
    fn local_address(&self) -> Address {
        self.address.clone()
    }

    fn send(
        &self,
        destination: Option<&Address>,
        payload: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<(), ChannelError> {
        let target = destination.map_or(Target::All, |address| Target::Member(address.clone()));
        self.cluster.submit(&self.address, target, payload, flags)
    }

    fn send_to_many(
        &self,
        destinations: &[Address],
        payload: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<(), ChannelError> {
        let target = Target::Many(destinations.to_vec());
        self.cluster.submit(&self.address, target, payload, flags)
    }

    fn send_to_site(
        &self,
        site: &str,
        payload: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<(), ChannelError> {
        self.cluster
            .submit(&self.address, Target::Site(site.to_string()), payload, flags)
    }

    fn is_multicast_capable(&self) -> bool {
        !self.cluster.unicast_only.get()
    }
}

impl LocalCluster {
    /// An empty cluster.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Make channels report that they cannot multicast.
    pub fn set_unicast_only(&self) {
        self.unicast_only.set(true);
    }

    /// Add a started member of `site`, with its handler installed.
    pub fn add_node(self: &Rc<Self>, name: &str, site: &str, config: TransportConfig) -> TestNode {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        let address = Address::new(UID::new(0, id), name)
            .with_topology(TopologyCoordinates::new(site, "rack-1", name));

        let channel = Rc::new(LocalChannel {
            cluster: self.clone(),
            address: address.clone(),
        });
        let transport = Node::new(TokioProviders::new(), JsonMarshaller, channel, config);
        let handler = Rc::new(KvHandler::new(name));
        transport.set_handler(handler.clone());
        transport.start();

        self.members.borrow_mut().push(Member {
            address: address.clone(),
            site: site.to_string(),
            transport: Rc::downgrade(&transport),
        });
        TestNode {
            transport,
            handler,
            address,
        }
    }

    /// Install view `view_id` with `members` on each of those members.
    pub fn install_view(&self, view_id: u64, members: &[Address]) {
        for address in members {
            if let Some(node) = self.node(address) {
                node.on_view_change(ViewEvent::new(view_id, members.to_vec()));
            }
        }
    }

    /// Drop every message sent to `address` from now on.
    pub fn mute(&self, address: &Address) {
        self.muted.borrow_mut().insert(address.clone());
    }

    /// Every message handed to the substrate so far.
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.borrow().clone()
    }

    /// Messages sent from `from` to the single member `to`.
    pub fn sent_to(&self, from: &Address, to: &Address) -> Vec<Sent> {
        self.sent
            .borrow()
            .iter()
            .filter(|s| s.from == *from && s.to == Target::Member(to.clone()))
            .cloned()
            .collect()
    }

    fn node(&self, address: &Address) -> Option<Rc<Node>> {
        self.members
            .borrow()
            .iter()
            .find(|m| m.address == *address)
            .and_then(|m| m.transport.upgrade())
    }

    fn site_of(&self, address: &Address) -> Option<String> {
        self.members
            .borrow()
            .iter()
            .find(|m| m.address == *address)
            .map(|m| m.site.clone())
    }

    fn submit(
        &self,
        from: &Address,
        target: Target,
        payload: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<(), ChannelError> {
        let recipients: Vec<Address> = match &target {
            Target::Member(address) => {
                if self.site_of(address).is_none() {
                    return Err(ChannelError::Unreachable(address.to_string()));
                }
                vec![address.clone()]
            }
            Target::Many(addresses) => addresses.clone(),
            Target::All => {
                let site = self.site_of(from);
                self.members
                    .borrow()
                    .iter()
                    .filter(|m| Some(&m.site) == site.as_ref())
                    .filter(|m| {
                        !(flags.contains(MessageFlags::DONT_LOOPBACK) && m.address == *from)
                    })
                    .map(|m| m.address.clone())
                    .collect()
            }
            Target::Site(site) => {
                let master = self
                    .members
                    .borrow()
                    .iter()
                    .find(|m| m.site == *site)
                    .map(|m| m.address.clone());
                match master {
                    Some(master) => vec![master],
                    None => return Err(ChannelError::Unreachable(site.clone())),
                }
            }
        };

        self.sent.borrow_mut().push(Sent {
            from: from.clone(),
            to: target,
            flags,
            payload: payload.clone(),
        });

        for recipient in recipients {
            if self.muted.borrow().contains(&recipient) {
                continue;
            }
            let Some(node) = self.node(&recipient) else {
                continue;
            };
            let sender = from.clone();
            let payload = payload.clone();
            tokio::task::spawn_local(async move {
                if let Err(err) = node.on_message(sender, &payload, flags) {
                    tracing::warn!(error = %err, "delivery rejected");
                }
            });
        }
        Ok(())
    }
}

/// Three started members of site `lon` sharing view 1.
pub fn three_nodes(config: TransportConfig) -> (Rc<LocalCluster>, Vec<TestNode>) {
    let cluster = LocalCluster::new();
    let nodes: Vec<TestNode> = ["n1", "n2", "n3"]
        .iter()
        .map(|name| cluster.add_node(name, "lon", config.clone()))
        .collect();
    cluster.install_view(1, &addresses(&nodes));
    (cluster, nodes)
}

/// Addresses of `nodes`, in order.
pub fn addresses(nodes: &[TestNode]) -> Vec<Address> {
    nodes.iter().map(|n| n.address.clone()).collect()
}

/// Let every spawned delivery and handler task run.
///
/// With a paused clock the sleep only ends once every task is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

/// Install a test subscriber once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

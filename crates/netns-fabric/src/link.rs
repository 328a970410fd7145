//! Link realization over rtnetlink
//!
//! Links live inside "backbone" namespaces, sharded by link count to
//! spread rtnetlink lock contention. An internal edge becomes a bridge
//! plus two veth pairs whose peer ends are prepositioned into the node
//! namespaces; a cross-host edge becomes a bridge, one veth toward the
//! local node, and a VXLAN tunnel to the peer server enslaved to the
//! bridge.
//!
//! Netlink sockets are bound to the network namespace of the thread that
//! opens them, so every namespace visit opens a fresh connection after
//! `setns` — the same socket-per-operation behavior the kernel sees from
//! `ip(8)`. All devices carry MTU 1450 to leave room for the VXLAN
//! header on the physical path.

use crate::config::{ConfigError, EngineContext};
use crate::env::{self, EnvError};
use crate::netns::{self, NetnsError, NetnsHandle};
use crate::node::{NodeError, NodeManager};
use futures::TryStreamExt;
use netlink_packet_route::link::{InfoData, InfoVeth, LinkAttribute, LinkFlags, LinkInfo};
use parking_lot::{Mutex, RwLock};
use rtnetlink::{new_connection, Handle};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use topology::Edge;
use tracing::{debug, info, warn};

/// MTU for bridges and veths; 1500 minus VXLAN overhead.
const LINK_MTU: u32 = 1450;
/// Well-known VXLAN UDP port.
const VXLAN_PORT: u16 = 4789;

/// rtnetlink lock probe bounds after wholesale namespace deletion.
const QUIESCE_SETTLE: Duration = Duration::from_secs(2);
const QUIESCE_PROBES: usize = 50;
const QUIESCE_WALL_CAP: Duration = Duration::from_secs(10);
const PROBE_DEVICE: &str = "probe-dummy";

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("failed to open netlink connection: {0}")]
    Connect(std::io::Error),

    #[error("failed to create bridge {name}: {source}")]
    BridgeCreate { name: String, source: rtnetlink::Error },

    #[error("failed to create veth {name}: {source}")]
    VethCreate { name: String, source: rtnetlink::Error },

    #[error("failed to create vxlan {name}: {source}")]
    VxlanCreate { name: String, source: rtnetlink::Error },

    #[error("failed to bring {name} up: {source}")]
    SetUp { name: String, source: rtnetlink::Error },

    #[error("failed to enslave {name} to {master}: {source}")]
    SetMaster {
        name: String,
        master: String,
        source: rtnetlink::Error,
    },

    #[error("failed to move {name} into namespace: {source}")]
    MoveToNamespace { name: String, source: rtnetlink::Error },

    #[error("failed to delete {name}: {source}")]
    Delete { name: String, source: rtnetlink::Error },

    #[error("rtnetlink probe failed: {0}")]
    ProbeFailed(rtnetlink::Error),

    #[error("device {0} not found")]
    NotFound(String),

    #[error("netlink lookup for {name} failed: {source}")]
    Lookup { name: String, source: rtnetlink::Error },

    #[error("local physical interface '{0}' not found")]
    PhyIntfMissing(String),

    #[error("invalid peer address '{0}' for cross-host edge")]
    BadPeerAddress(String),

    #[error("link manager not initialized")]
    NotInitialized,

    #[error("no active backbone namespace")]
    NoActiveBackbone,

    #[error("namespace error: {0}")]
    Netns(#[from] NetnsError),

    #[error("node manager error: {0}")]
    Node(#[from] NodeError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("environment error: {0}")]
    Env(#[from] EnvError),
}

/// Deterministic per-link device names, derived from the global link
/// index alone so parallel setup cannot perturb them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNames {
    pub bridge: String,
    pub veth_i: String,
    pub veth_j: String,
    pub vxlan: String,
    pub veth_x: String,
}

impl DeviceNames {
    pub fn for_link(link_index: u64) -> Self {
        Self {
            bridge: format!("br-{}", link_index),
            veth_i: format!("eth-{}-i", link_index),
            veth_j: format!("eth-{}-j", link_index),
            vxlan: format!("eth-{}-v", link_index),
            veth_x: format!("vxl-{}", link_index),
        }
    }
}

/// Capability set the realization engine needs from a link backend.
pub trait LinkManager: Send + Sync {
    /// Snapshot the host namespace and reset the counters.
    fn init(&self) -> Result<(), LinkError>;

    /// Create `bbns{next}` and switch the calling thread into it.
    fn enter_new_backbone(&self) -> Result<Arc<NetnsHandle>, LinkError>;

    /// Switch the calling thread into an existing backbone (worker-task
    /// entry point).
    fn enter_backbone(&self, bb: &NetnsHandle) -> Result<(), LinkError>;

    /// Switch the calling thread back to the host namespace.
    fn enter_host(&self) -> Result<(), LinkError>;

    /// Allocate the next global link index.
    fn next_link_index(&self) -> u64;

    /// Realize one edge. Precondition: the calling thread is inside `bb`;
    /// postcondition: it is back inside `bb`.
    fn setup_link(
        &self,
        bb: &NetnsHandle,
        link_index: u64,
        edge: &Edge,
    ) -> impl std::future::Future<Output = Result<(), LinkError>> + Send;

    /// Destroy every named namespace, then wait out the rtnetlink lock.
    fn clean_all_backbones(
        &self,
    ) -> impl std::future::Future<Output = Result<(), LinkError>> + Send;

    /// Probe until rtnetlink operations respond again.
    fn quiesce(&self) -> impl std::future::Future<Output = Result<(), LinkError>> + Send;

    /// Release the host handle and the current backbone.
    fn delete(&self);
}

struct Counters {
    next_link: u64,
    next_backbone: u32,
}

/// Netlink/bridge link manager (the `ntlbr` backend).
pub struct NtlBrLinkManager<NM> {
    ctx: Arc<EngineContext>,
    nodes: Arc<NM>,
    host_ns: RwLock<Option<Arc<NetnsHandle>>>,
    cur_backbone: RwLock<Option<Arc<NetnsHandle>>>,
    counters: Mutex<Counters>,
    phy_index: Mutex<Option<u32>>,
}

impl<NM: NodeManager> NtlBrLinkManager<NM> {
    pub fn new(ctx: Arc<EngineContext>, nodes: Arc<NM>) -> Self {
        Self {
            ctx,
            nodes,
            host_ns: RwLock::new(None),
            cur_backbone: RwLock::new(None),
            counters: Mutex::new(Counters {
                next_link: 0,
                next_backbone: 0,
            }),
            phy_index: Mutex::new(None),
        }
    }

    fn host_handle(&self) -> Result<Arc<NetnsHandle>, LinkError> {
        self.host_ns.read().clone().ok_or(LinkError::NotInitialized)
    }

    /// VTEP device index, resolved through a host-namespace socket on the
    /// first cross-host edge and cached.
    async fn vtep_index(&self, host: &Handle) -> Result<u32, LinkError> {
        if let Some(index) = *self.phy_index.lock() {
            return Ok(index);
        }
        let index = link_index(host, &self.ctx.phy_intf)
            .await
            .map_err(|_| LinkError::PhyIntfMissing(self.ctx.phy_intf.clone()))?;
        *self.phy_index.lock() = Some(index);
        Ok(index)
    }

    /// Bridge + two veth pairs, peers prepositioned into both node
    /// namespaces.
    async fn setup_internal_link(
        &self,
        bb: &NetnsHandle,
        names: &DeviceNames,
        edge: &Edge,
    ) -> Result<(), LinkError> {
        let ns_i = self.nodes.node_netns(edge.a)?;
        let ns_j = self.nodes.node_netns(edge.b)?;

        let handle = connect()?;
        let bridge_index = add_bridge(&handle, &names.bridge).await?;
        add_veth_into(&handle, &names.veth_i, bridge_index, &ns_i).await?;
        add_veth_into(&handle, &names.veth_j, bridge_index, &ns_j).await?;

        // Bring the node-side ends up, then return to the backbone.
        bring_up_in_namespace(&ns_i, &names.veth_i).await?;
        bring_up_in_namespace(&ns_j, &names.veth_j).await?;
        bb.enter()?;
        Ok(())
    }

    /// Bridge + veth toward the local node + VXLAN tunnel to the peer
    /// server. The VXLAN must be created by a host-namespace socket so
    /// the VTEP device resolves, then moved into the backbone.
    async fn setup_external_link(
        &self,
        bb: &NetnsHandle,
        names: &DeviceNames,
        edge: &Edge,
    ) -> Result<(), LinkError> {
        let ns_i = self.nodes.node_netns(edge.a)?;
        let host = self.host_handle()?;

        host.enter()?;
        let host_handle = connect()?;
        let vtep = self.vtep_index(&host_handle).await?;
        let peer = self.ctx.peer_addr(edge.server)?;
        let remote: Ipv4Addr = peer
            .parse()
            .map_err(|_| LinkError::BadPeerAddress(peer.to_string()))?;

        host_handle
            .link()
            .add()
            .vxlan(names.vxlan.clone(), edge.vxlan as u32)
            .link(vtep)
            .port(VXLAN_PORT)
            .remote(remote)
            .learning(true)
            .execute()
            .await
            .map_err(|source| LinkError::VxlanCreate {
                name: names.vxlan.clone(),
                source,
            })?;
        let vxlan_index = link_index(&host_handle, &names.vxlan).await?;
        host_handle
            .link()
            .set(vxlan_index)
            .setns_by_fd(bb.raw_fd())
            .execute()
            .await
            .map_err(|source| LinkError::MoveToNamespace {
                name: names.vxlan.clone(),
                source,
            })?;

        bb.enter()?;
        let handle = connect()?;
        let bridge_index = add_bridge(&handle, &names.bridge).await?;
        add_veth_into(&handle, &names.veth_x, bridge_index, &ns_i).await?;

        // The move into the backbone renumbered the vxlan.
        let vxlan_index = link_index(&handle, &names.vxlan).await?;
        handle
            .link()
            .set(vxlan_index)
            .controller(bridge_index)
            .execute()
            .await
            .map_err(|source| LinkError::SetMaster {
                name: names.vxlan.clone(),
                master: names.bridge.clone(),
                source,
            })?;
        handle
            .link()
            .set(vxlan_index)
            .up()
            .execute()
            .await
            .map_err(|source| LinkError::SetUp {
                name: names.vxlan.clone(),
                source,
            })?;

        bring_up_in_namespace(&ns_i, &names.veth_x).await?;
        bb.enter()?;
        Ok(())
    }
}

impl<NM: NodeManager> LinkManager for NtlBrLinkManager<NM> {
    fn init(&self) -> Result<(), LinkError> {
        *self.host_ns.write() = Some(Arc::new(NetnsHandle::current()?));
        *self.cur_backbone.write() = None;
        let mut counters = self.counters.lock();
        counters.next_link = 0;
        counters.next_backbone = 0;
        Ok(())
    }

    fn enter_new_backbone(&self) -> Result<Arc<NetnsHandle>, LinkError> {
        let index = {
            let mut counters = self.counters.lock();
            let index = counters.next_backbone;
            counters.next_backbone += 1;
            index
        };
        let name = format!("bbns{}", index);
        // create_named leaves the calling thread inside the namespace.
        let handle = Arc::new(NetnsHandle::create_named(&name)?);
        if self.ctx.disable_ipv6 {
            env::disable_ipv6_for_current_netns()?;
        }
        debug!("entered backbone {}", name);
        // Dropping the previous Arc closes it once in-flight tasks finish.
        *self.cur_backbone.write() = Some(handle.clone());
        Ok(handle)
    }

    fn enter_backbone(&self, bb: &NetnsHandle) -> Result<(), LinkError> {
        bb.enter()?;
        Ok(())
    }

    fn enter_host(&self) -> Result<(), LinkError> {
        self.host_handle()?.enter()?;
        Ok(())
    }

    fn next_link_index(&self) -> u64 {
        let mut counters = self.counters.lock();
        let index = counters.next_link;
        counters.next_link += 1;
        index
    }

    async fn setup_link(
        &self,
        bb: &NetnsHandle,
        link_index: u64,
        edge: &Edge,
    ) -> Result<(), LinkError> {
        let names = DeviceNames::for_link(link_index);
        if edge.is_internal() {
            self.setup_internal_link(bb, &names, edge).await
        } else {
            self.setup_external_link(bb, &names, edge).await
        }
    }

    async fn clean_all_backbones(&self) -> Result<(), LinkError> {
        let removed = netns::delete_all_named()?;
        info!("deleted {} named namespaces", removed);
        self.quiesce().await
    }

    async fn quiesce(&self) -> Result<(), LinkError> {
        let started = Instant::now();
        sleep(QUIESCE_SETTLE).await;

        let handle = connect()?;
        for probe in 0..QUIESCE_PROBES {
            if started.elapsed() > QUIESCE_WALL_CAP {
                warn!("rtnetlink quiesce hit wall-clock cap after {} probes", probe);
                break;
            }
            handle
                .link()
                .add()
                .dummy(PROBE_DEVICE.to_string())
                .execute()
                .await
                .map_err(LinkError::ProbeFailed)?;
            let index = link_index(&handle, PROBE_DEVICE).await?;
            handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(|source| LinkError::Delete {
                    name: PROBE_DEVICE.to_string(),
                    source,
                })?;
        }
        debug!("rtnetlink quiesce took {:?}", started.elapsed());
        Ok(())
    }

    fn delete(&self) {
        *self.cur_backbone.write() = None;
        *self.host_ns.write() = None;
    }
}

/// Open an rtnetlink connection in the calling thread's current
/// namespace; the connection future runs on the ambient runtime.
fn connect() -> Result<Handle, LinkError> {
    let (connection, handle, _) = new_connection().map_err(LinkError::Connect)?;
    tokio::spawn(connection);
    Ok(handle)
}

async fn link_index(handle: &Handle, name: &str) -> Result<u32, LinkError> {
    let mut links = handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(link.header.index),
        Ok(None) => Err(LinkError::NotFound(name.to_string())),
        Err(source) => Err(LinkError::Lookup {
            name: name.to_string(),
            source,
        }),
    }
}

/// Create a bridge, MTU 1450 and administratively up, and return its
/// index.
async fn add_bridge(handle: &Handle, name: &str) -> Result<u32, LinkError> {
    let mut req = handle.link().add().bridge(name.to_string());
    let message = req.message_mut();
    message.header.flags |= LinkFlags::Up;
    message.header.change_mask |= LinkFlags::Up;
    message.attributes.push(LinkAttribute::Mtu(LINK_MTU));
    req.execute()
        .await
        .map_err(|source| LinkError::BridgeCreate {
            name: name.to_string(),
            source,
        })?;
    link_index(handle, name).await
}

/// Create a veth pair whose local end is enslaved to `bridge_index` and
/// whose peer end lands directly inside `peer_ns`, both ends carrying
/// the same name. The peer is created down; the caller brings it up from
/// inside the node namespace.
async fn add_veth_into(
    handle: &Handle,
    name: &str,
    bridge_index: u32,
    peer_ns: &NetnsHandle,
) -> Result<(), LinkError> {
    let mut req = handle
        .link()
        .add()
        .veth(name.to_string(), name.to_string());
    let message = req.message_mut();
    message.header.flags |= LinkFlags::Up;
    message.header.change_mask |= LinkFlags::Up;
    message.attributes.push(LinkAttribute::Mtu(LINK_MTU));
    message
        .attributes
        .push(LinkAttribute::Controller(bridge_index));
    for attribute in message.attributes.iter_mut() {
        if let LinkAttribute::LinkInfo(infos) = attribute {
            for link_info in infos.iter_mut() {
                if let LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer))) = link_info {
                    peer.attributes
                        .push(LinkAttribute::NetNsFd(peer_ns.raw_fd()));
                    peer.attributes.push(LinkAttribute::Mtu(LINK_MTU));
                }
            }
        }
    }
    req.execute()
        .await
        .map_err(|source| LinkError::VethCreate {
            name: name.to_string(),
            source,
        })
}

/// Enter `ns`, bring `name` up through a socket bound to that namespace.
/// The caller is responsible for returning to its own namespace.
async fn bring_up_in_namespace(ns: &NetnsHandle, name: &str) -> Result<(), LinkError> {
    ns.enter()?;
    let handle = connect()?;
    let index = link_index(&handle, name).await?;
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|source| LinkError::SetUp {
            name: name.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names_are_deterministic_per_index() {
        let names = DeviceNames::for_link(0);
        assert_eq!(names.bridge, "br-0");
        assert_eq!(names.veth_i, "eth-0-i");
        assert_eq!(names.veth_j, "eth-0-j");
        assert_eq!(names.vxlan, "eth-0-v");
        assert_eq!(names.veth_x, "vxl-0");

        let again = DeviceNames::for_link(0);
        assert_eq!(names, again);

        let other = DeviceNames::for_link(42);
        assert_eq!(other.bridge, "br-42");
        assert_eq!(other.vxlan, "eth-42-v");
    }

    #[test]
    fn device_names_fit_ifnamsiz_at_realistic_scale() {
        // IFNAMSIZ is 16 including the terminator.
        let names = DeviceNames::for_link(99_999_999);
        for name in [
            &names.bridge,
            &names.veth_i,
            &names.veth_j,
            &names.vxlan,
            &names.veth_x,
        ] {
            assert!(name.len() <= 15, "{} exceeds IFNAMSIZ", name);
        }
    }

    #[test]
    fn counters_allocate_monotonically() {
        use crate::config::EngineContext;
        use crate::node::CctrNodeManager;

        let ctx = Arc::new(EngineContext::local_default(false, 0, 1).unwrap());
        let nodes = Arc::new(CctrNodeManager::new(ctx.clone()));
        let lm = NtlBrLinkManager::new(ctx, nodes);
        assert_eq!(lm.next_link_index(), 0);
        assert_eq!(lm.next_link_index(), 1);
        assert_eq!(lm.next_link_index(), 2);
    }

    #[test]
    fn uninitialized_manager_has_no_host_handle() {
        use crate::config::EngineContext;
        use crate::node::CctrNodeManager;

        let ctx = Arc::new(EngineContext::local_default(false, 0, 1).unwrap());
        let nodes = Arc::new(CctrNodeManager::new(ctx.clone()));
        let lm = NtlBrLinkManager::new(ctx, nodes);
        assert!(matches!(lm.enter_host(), Err(LinkError::NotInitialized)));
    }
}

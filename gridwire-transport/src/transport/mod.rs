//! The dispatch core.
//!
//! [`GroupTransport`] sits between the application and the group substrate.
//! Outbound, it picks the cheapest delivery for a call (nothing, a unicast, a
//! fan-out, a broadcast or a totally ordered anycast), registers a request for
//! synchronous calls and hands frames to the bundler, the credit map or the
//! channel directly. Inbound, the substrate calls the `on_*` entry points:
//! responses are routed to their request, commands to the application handler
//! through the ordered executor.
//!
//! Every public operation is meant to be called from inside a
//! `tokio::task::LocalSet`.

mod backup;

pub use backup::{BackupOutcome, BackupResponse, XSiteBackup};

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use gridwire_core::{Address, Marshaller, Providers, TaskProvider};
use tracing::{debug, error, info, trace, warn};

use crate::bundler::{BundleKey, Bundler, TransmitFn};
use crate::channel::GroupChannel;
use crate::collector::{
    FilterMapResponseCollector, MapResponseCollector, ResponseCollector, SingleResponseCollector,
};
use crate::config::TransportConfig;
use crate::error::{ChannelError, TransportError};
use crate::flow_control::{CreditKey, CreditMap, ExecutionContext, SendPermit};
use crate::inbound::{InboundInvocationHandler, LocalJob, OrderedExecutor, ReplyPromise};
use crate::order::{DeliverOrder, MessageFlags};
use crate::request::{
    NO_REQUEST_ID, PendingRequest, ReplyHandle, Request, RequestId, RequestRepository, SendFn,
};
use crate::response::{
    FailureKind, RemoteFailure, ReplicableCommand, Response, ResponseFilter, ResponseMode,
    RpcOptions,
};
use crate::view::{
    AddressCache, ClusterView, MembershipListener, ViewChangedEvent, ViewEvent, ViewTracker,
};
use crate::wire::{Frame, FrameKind, decode_batch, decode_frame, encode_frame};

/// Where an outbound frame goes.
#[derive(Debug, Clone)]
enum Destination {
    Member(Address),
    All,
    Many(Vec<Address>),
    Site(String),
}

impl Destination {
    fn credit_key(&self) -> Option<CreditKey> {
        match self {
            Destination::Member(address) => Some(CreditKey::Unicast(address.clone())),
            Destination::All | Destination::Many(_) => Some(CreditKey::Multicast),
            // cross-site links are metered by the relay, not here
            Destination::Site(_) => None,
        }
    }
}

fn deliver(
    channel: &dyn GroupChannel,
    destination: &Destination,
    frame: Vec<u8>,
    flags: MessageFlags,
) -> Result<(), ChannelError> {
    match destination {
        Destination::Member(address) => channel.send(Some(address), frame, flags),
        Destination::All => channel.send(None, frame, flags),
        Destination::Many(addresses) => channel.send_to_many(addresses, frame, flags),
        Destination::Site(site) => channel.send_to_site(site, frame, flags),
    }
}

/// Drive `sending` until it is done or the call completes, then wait for the
/// result.
///
/// A call can complete while its frames are still waiting for credits or for
/// a bundle buffer, for instance when it times out.
async fn send_then_wait<O>(
    sending: impl Future<Output = ()>,
    mut handle: ReplyHandle<O>,
) -> Result<O, TransportError> {
    tokio::select! {
        biased;
        result = &mut handle => return result,
        () = sending => {}
    }
    handle.await
}

fn successful_only<V: 'static>() -> ResponseFilter<V> {
    Rc::new(|_: &Address, response: &Response<V>| response.is_successful())
}

/// Request/response transport over a group-communication substrate.
///
/// Generic over the runtime providers `P`, the marshaller `M` and the
/// application command type `C`. Created with [`GroupTransport::new`], driven
/// by the substrate through the `on_*` entry points.
pub struct GroupTransport<P, M, C>
where
    P: Providers,
    M: Marshaller,
    C: ReplicableCommand,
{
    providers: P,
    marshaller: M,
    config: TransportConfig,
    channel: Rc<dyn GroupChannel>,
    handler: RefCell<Option<Rc<dyn InboundInvocationHandler<C>>>>,
    local_address: RefCell<Option<Address>>,
    views: ViewTracker,
    addresses: AddressCache,
    sites: RefCell<BTreeSet<String>>,
    requests: RequestRepository<C::Value>,
    inbound: OrderedExecutor<P>,
    credits: Option<CreditMap<P>>,
    bundler: Option<Bundler<P>>,
    listeners: RefCell<Vec<Rc<dyn MembershipListener>>>,
    running: Cell<bool>,
    weak_self: Weak<Self>,
}

impl<P, M, C> GroupTransport<P, M, C>
where
    P: Providers,
    M: Marshaller,
    C: ReplicableCommand,
{
    /// Create a stopped transport sending through `channel`.
    pub fn new(
        providers: P,
        marshaller: M,
        channel: Rc<dyn GroupChannel>,
        config: TransportConfig,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak_self: &Weak<Self>| {
            let credits = config
                .flow_control
                .enabled
                .then(|| CreditMap::new(providers.clone(), config.flow_control.max_credits));

            let bundler = config.bundler.enabled.then(|| {
                let weak = weak_self.clone();
                let transmit: TransmitFn = Rc::new(move |key: &BundleKey, bytes: Vec<u8>| {
                    let Some(transport) = weak.upgrade() else {
                        return;
                    };
                    let destination = key
                        .destination
                        .clone()
                        .map_or(Destination::All, Destination::Member);
                    if let Err(err) = transport.transmit(
                        ExecutionContext::NonBlocking,
                        destination,
                        bytes,
                        key.flags,
                    ) {
                        warn!(
                            destination = ?key.destination,
                            error = %err,
                            "bundle transmission failed"
                        );
                    }
                });
                Bundler::new(providers.clone(), config.bundler.max_bundle_size, transmit)
            });

            let requests = RequestRepository::new();
            requests.set_running(false);

            Self {
                inbound: OrderedExecutor::new(providers.clone()),
                providers,
                marshaller,
                config,
                channel,
                handler: RefCell::new(None),
                local_address: RefCell::new(None),
                views: ViewTracker::new(),
                addresses: AddressCache::default(),
                sites: RefCell::new(BTreeSet::new()),
                requests,
                credits,
                bundler,
                listeners: RefCell::new(Vec::new()),
                running: Cell::new(false),
                weak_self: weak_self.clone(),
            }
        })
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Start accepting calls and inbound commands.
    pub fn start(&self) {
        if self.running.replace(true) {
            return;
        }
        self.requests.set_running(true);
        if let Some(bundler) = &self.bundler {
            bundler.start();
        }
        info!(address = %self.local(), "transport started");
    }

    /// Stop the transport.
    ///
    /// Pending calls fail with [`TransportError::LifecycleStopping`], view
    /// waiters are released with the same error, and inbound commands are
    /// answered with [`Response::NotFound`] from now on.
    pub fn stop(&self) {
        if !self.running.replace(false) {
            return;
        }
        info!(address = %self.local(), pending = self.requests.len(), "transport stopping");
        self.views.stop();
        self.requests.cancel_all(TransportError::LifecycleStopping);
        if let Some(bundler) = &self.bundler {
            bundler.stop();
        }
        if let Some(credits) = &self.credits {
            credits.clear();
        }
    }

    /// Whether the transport is started and not stopped.
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Install the handler for inbound commands.
    pub fn set_handler(&self, handler: Rc<dyn InboundInvocationHandler<C>>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    /// Register a membership listener.
    pub fn add_listener(&self, listener: Rc<dyn MembershipListener>) {
        self.listeners.borrow_mut().push(listener);
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.running.get() {
            Ok(())
        } else {
            Err(TransportError::LifecycleStopping)
        }
    }

    // ---------------------------------------------------------------------
    // Membership queries
    // ---------------------------------------------------------------------

    /// Local address, known once the first view is installed.
    pub fn address(&self) -> Option<Address> {
        self.local_address.borrow().clone()
    }

    fn local(&self) -> Address {
        self.address().unwrap_or_else(|| self.channel.local_address())
    }

    fn is_local(&self, address: &Address) -> bool {
        *address == self.local()
    }

    /// Members of the current view, in view order.
    pub fn members(&self) -> Vec<Address> {
        self.views.current().members().to_vec()
    }

    /// Coordinator of the current view.
    pub fn coordinator(&self) -> Option<Address> {
        self.views.current().coordinator().cloned()
    }

    /// Whether the local member coordinates the current view.
    pub fn is_coordinator(&self) -> bool {
        self.views.current().is_coordinator(&self.local())
    }

    /// Id of the current view.
    pub fn view_id(&self) -> u64 {
        self.views.current().view_id()
    }

    /// Snapshot of the current view.
    pub fn view(&self) -> Rc<ClusterView> {
        self.views.current()
    }

    /// Remote sites currently reachable.
    pub fn sites_view(&self) -> BTreeSet<String> {
        self.sites.borrow().clone()
    }

    /// Whether a broadcast reaches every member with one send.
    pub fn is_multicast_capable(&self) -> bool {
        self.channel.is_multicast_capable()
    }

    /// Wait until a view with at least `view_id` is installed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::LifecycleStopping`] if the transport stops
    /// first.
    pub async fn wait_for_view(&self, view_id: u64) -> Result<Rc<ClusterView>, TransportError> {
        self.views.wait_for_view(view_id).await
    }

    /// Number of calls waiting for responses.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    // ---------------------------------------------------------------------
    // Synchronous calls
    // ---------------------------------------------------------------------

    /// Invoke `command` on `target` and fold its response with `collector`.
    ///
    /// A call to the local member is elided (the collector is finished right
    /// away) unless `order` is total. A target outside the current view is
    /// reported to the collector as gone before anything is sent.
    pub async fn invoke_command<Co>(
        &self,
        target: &Address,
        command: &C,
        collector: Co,
        order: DeliverOrder,
        timeout: Duration,
    ) -> Result<Co::Output, TransportError>
    where
        Co: ResponseCollector<C::Value> + 'static,
    {
        let mut collector = collector;
        if self.is_local(target) && !order.is_total() {
            return collector.finish();
        }

        let request_id = self.requests.new_request_id();
        let frame = self.encode_command(FrameKind::Request, request_id, command)?;
        let (request, handle) =
            Request::single_target(self.providers.clone(), request_id, target.clone(), collector);
        if !self.register(&request, timeout)
            || request.on_new_view(self.views.current().member_set())
        {
            return handle.await;
        }

        trace!(request_id, target = %target, command = command.name(), %order, "invoking command");
        let sending = async {
            let destination = Destination::Member(target.clone());
            if let Err(err) = self.route(destination, frame, order.to_flags()).await {
                request.cancel(err);
            }
        };
        send_then_wait(sending, handle).await
    }

    /// Invoke `command` on every member of `targets`.
    ///
    /// The local member is dropped from the targets unless `order` is total.
    /// Totally ordered calls go out as one multi-destination message, so every
    /// recipient sees it at the same position; other calls fan out as
    /// unicasts.
    pub async fn invoke_commands<Co>(
        &self,
        targets: &[Address],
        command: &C,
        collector: Co,
        order: DeliverOrder,
        timeout: Duration,
    ) -> Result<Co::Output, TransportError>
    where
        Co: ResponseCollector<C::Value> + 'static,
    {
        let targets = self.remote_targets(targets, order);
        let mut collector = collector;
        if targets.is_empty() {
            return collector.finish();
        }

        let request_id = self.requests.new_request_id();
        let frame = self.encode_command(FrameKind::Request, request_id, command)?;
        let (request, handle) =
            Request::multi_target(self.providers.clone(), request_id, targets.clone(), collector);
        let view = self.views.current();
        if !self.register(&request, timeout) || request.on_new_view(view.member_set()) {
            return handle.await;
        }

        trace!(
            request_id,
            targets = targets.len(),
            command = command.name(),
            %order,
            "invoking command on targets"
        );
        let live: Vec<Address> = targets.into_iter().filter(|t| view.contains(t)).collect();
        let flags = order.to_flags();
        let sending = async {
            if order.is_total() {
                let flags = flags | MessageFlags::DONT_BUNDLE;
                if let Err(err) = self.route(Destination::Many(live), frame, flags).await {
                    request.cancel(err);
                }
            } else {
                let frames = live.into_iter().map(|target| (target, frame.clone()));
                self.fan_out(&*request, frames, flags).await;
            }
        };
        send_then_wait(sending, handle).await
    }

    /// Invoke `command` on every member of the current view.
    ///
    /// With exactly one other member the broadcast degrades to a unicast.
    pub async fn invoke_command_on_all<Co>(
        &self,
        command: &C,
        collector: Co,
        order: DeliverOrder,
        timeout: Duration,
    ) -> Result<Co::Output, TransportError>
    where
        Co: ResponseCollector<C::Value> + 'static,
    {
        let view = self.views.current();
        let targets = self.remote_targets(view.members(), order);
        let mut collector = collector;
        if targets.is_empty() {
            return collector.finish();
        }

        let request_id = self.requests.new_request_id();
        let frame = self.encode_command(FrameKind::Request, request_id, command)?;
        let (request, handle) =
            Request::multi_target(self.providers.clone(), request_id, targets.clone(), collector);
        if !self.register(&request, timeout) {
            return handle.await;
        }

        trace!(
            request_id,
            targets = targets.len(),
            command = command.name(),
            %order,
            "invoking command on all"
        );
        let sending = async {
            if let Err(err) = self.broadcast(&targets, frame, order).await {
                request.cancel(err);
            }
        };
        send_then_wait(sending, handle).await
    }

    /// Invoke `command` on `targets` one at a time.
    ///
    /// The next candidate is contacted when the previous one did not answer
    /// within its share of the remaining deadline, or answered with a
    /// response the collector does not accept. Contacted candidates are never
    /// abandoned; the first acceptable answer from any of them wins.
    pub async fn invoke_command_staggered<Co>(
        &self,
        targets: &[Address],
        command: &C,
        collector: Co,
        timeout: Duration,
    ) -> Result<Co::Output, TransportError>
    where
        Co: ResponseCollector<C::Value> + 'static,
    {
        let order = DeliverOrder::None;
        let targets = self.remote_targets(targets, order);
        let mut collector = collector;
        if targets.is_empty() {
            return collector.finish();
        }

        let request_id = self.requests.new_request_id();
        let frame = self.encode_command(FrameKind::Request, request_id, command)?;
        let weak = self.weak_self.clone();
        let send: SendFn = Rc::new(move |target: &Address| {
            let Some(transport) = weak.upgrade() else {
                return Err(TransportError::LifecycleStopping);
            };
            transport.route_now(
                Destination::Member(target.clone()),
                frame.clone(),
                order.to_flags(),
            )
        });

        let (request, handle) = Request::staggered(
            self.providers.clone(),
            request_id,
            targets,
            collector,
            send,
            timeout,
            self.config.min_stagger_delay,
        );
        if self.register(&request, timeout)
            && !request.on_new_view(self.views.current().member_set())
        {
            trace!(request_id, command = command.name(), "starting staggered invocation");
            request.start();
        }
        handle.await
    }

    /// Invoke a different command on each target, correlated as one call.
    ///
    /// `command_for` builds the command for each remote target.
    pub async fn invoke_commands_per_target<Co, F>(
        &self,
        targets: &[Address],
        mut command_for: F,
        collector: Co,
        order: DeliverOrder,
        timeout: Duration,
    ) -> Result<Co::Output, TransportError>
    where
        Co: ResponseCollector<C::Value> + 'static,
        F: FnMut(&Address) -> C,
    {
        let targets = self.remote_targets(targets, order);
        let mut collector = collector;
        if targets.is_empty() {
            return collector.finish();
        }

        let request_id = self.requests.new_request_id();
        let mut frames = Vec::with_capacity(targets.len());
        for target in &targets {
            let command = command_for(target);
            let frame = self.encode_command(FrameKind::Request, request_id, &command)?;
            frames.push((target.clone(), frame));
        }

        let (request, handle) =
            Request::multi_target(self.providers.clone(), request_id, targets, collector);
        let view = self.views.current();
        if !self.register(&request, timeout) || request.on_new_view(view.member_set()) {
            return handle.await;
        }

        trace!(request_id, targets = frames.len(), %order, "invoking per-target commands");
        let frames = frames.into_iter().filter(|(target, _)| view.contains(target));
        let sending = self.fan_out(&*request, frames, order.to_flags());
        send_then_wait(sending, handle).await
    }

    /// Invoke `command` and collect one response per recipient.
    ///
    /// `None` recipients means the whole view. In
    /// [`ResponseMode::Synchronous`] a recipient that already left fails the
    /// call with [`TransportError::MemberSuspected`];
    /// [`ResponseMode::SynchronousIgnoreLeavers`] drops it instead.
    /// [`ResponseMode::WaitForValidResponse`] returns as soon as one recipient
    /// succeeds, and fails with [`TransportError::RequestTimedOut`] if none
    /// does. [`ResponseMode::Asynchronous`] sends one-way messages and
    /// returns an empty map.
    pub async fn invoke_remotely(
        &self,
        recipients: Option<&[Address]>,
        command: &C,
        mode: ResponseMode,
        timeout: Duration,
    ) -> Result<HashMap<Address, Response<C::Value>>, TransportError> {
        self.invoke_remotely_with(recipients, command, RpcOptions::new(mode, timeout))
            .await
    }

    /// [`invoke_remotely`](Self::invoke_remotely) with a delivery order and a
    /// response filter.
    pub async fn invoke_remotely_with(
        &self,
        recipients: Option<&[Address]>,
        command: &C,
        options: RpcOptions<C::Value>,
    ) -> Result<HashMap<Address, Response<C::Value>>, TransportError> {
        let RpcOptions {
            mode,
            timeout,
            order,
            filter,
        } = options;
        if !mode.is_synchronous() {
            match recipients {
                None => self.send_to_all(command, order).await?,
                Some(recipients) => self.send_to_many(recipients, command, order).await?,
            }
            return Ok(HashMap::new());
        }

        let view = self.views.current();
        let recipients = match recipients {
            None => None,
            Some(requested) => {
                let mut live = Vec::with_capacity(requested.len());
                for address in requested {
                    if view.contains(address) {
                        live.push(address.clone());
                    } else if mode == ResponseMode::Synchronous {
                        return Err(TransportError::MemberSuspected {
                            address: address.clone(),
                        });
                    } else {
                        debug!(recipient = %address, "dropping recipient outside the view");
                    }
                }
                Some(live)
            }
        };
        let expected = self
            .remote_targets(recipients.as_deref().unwrap_or(view.members()), order)
            .len();

        match (mode, filter) {
            (ResponseMode::WaitForValidResponse, filter) => {
                let filter = filter.unwrap_or_else(successful_only);
                let collector = FilterMapResponseCollector::new(
                    move |sender: &Address, response: &Response<C::Value>| filter(sender, response),
                    false,
                    expected,
                );
                let responses = self
                    .invoke_on(recipients.as_deref(), command, collector, order, timeout)
                    .await?;
                if responses.is_empty() && expected > 0 {
                    return Err(TransportError::RequestTimedOut {
                        request_id: NO_REQUEST_ID,
                        missing: Vec::new(),
                    });
                }
                Ok(responses)
            }
            (_, Some(filter)) => {
                let collector = FilterMapResponseCollector::new(
                    move |sender: &Address, response: &Response<C::Value>| filter(sender, response),
                    true,
                    expected,
                );
                self.invoke_on(recipients.as_deref(), command, collector, order, timeout)
                    .await
            }
            (_, None) => {
                let ignore_leavers = mode == ResponseMode::SynchronousIgnoreLeavers;
                let collector = MapResponseCollector::new(ignore_leavers, expected);
                self.invoke_on(recipients.as_deref(), command, collector, order, timeout)
                    .await
            }
        }
    }

    async fn invoke_on<Co>(
        &self,
        recipients: Option<&[Address]>,
        command: &C,
        collector: Co,
        order: DeliverOrder,
        timeout: Duration,
    ) -> Result<Co::Output, TransportError>
    where
        Co: ResponseCollector<C::Value> + 'static,
    {
        match recipients {
            None => {
                self.invoke_command_on_all(command, collector, order, timeout)
                    .await
            }
            Some(recipients) => {
                self.invoke_commands(recipients, command, collector, order, timeout)
                    .await
            }
        }
    }

    // ---------------------------------------------------------------------
    // One-way messages
    // ---------------------------------------------------------------------

    /// Send `command` to `target` without waiting for an answer.
    pub async fn send_to(
        &self,
        target: &Address,
        command: &C,
        order: DeliverOrder,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        if self.is_local(target) && !order.is_total() {
            return Ok(());
        }
        let frame = self.encode_command(FrameKind::SingleMessage, NO_REQUEST_ID, command)?;
        self.route(Destination::Member(target.clone()), frame, order.to_flags())
            .await
    }

    /// Send `command` to every member of `targets` without waiting.
    pub async fn send_to_many(
        &self,
        targets: &[Address],
        command: &C,
        order: DeliverOrder,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        let targets = self.remote_targets(targets, order);
        if targets.is_empty() {
            return Ok(());
        }
        let frame = self.encode_command(FrameKind::SingleMessage, NO_REQUEST_ID, command)?;
        let flags = order.to_flags();
        if order.is_total() {
            return self
                .route(Destination::Many(targets), frame, flags | MessageFlags::DONT_BUNDLE)
                .await;
        }
        for target in targets {
            self.route(Destination::Member(target), frame.clone(), flags)
                .await?;
        }
        Ok(())
    }

    /// Send `command` to every member of the current view without waiting.
    pub async fn send_to_all(
        &self,
        command: &C,
        order: DeliverOrder,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        let targets = self.remote_targets(self.views.current().members(), order);
        if targets.is_empty() {
            return Ok(());
        }
        let frame = self.encode_command(FrameKind::SingleMessage, NO_REQUEST_ID, command)?;
        self.broadcast(&targets, frame, order).await
    }

    // ---------------------------------------------------------------------
    // Cross-site
    // ---------------------------------------------------------------------

    /// Replicate `command` to remote sites.
    ///
    /// Synchronous backups are tracked by one request each, so one site
    /// failing does not fail the others. Asynchronous backups are one-way
    /// messages and never appear in the returned [`BackupResponse`].
    pub async fn backup_remotely(
        &self,
        backups: &[XSiteBackup],
        command: &C,
    ) -> Result<BackupResponse<C::Value>, TransportError> {
        self.ensure_running()?;
        let flags = DeliverOrder::PerSender.to_flags() | MessageFlags::DONT_BUNDLE;
        let mut pending = Vec::with_capacity(backups.len());

        for backup in backups {
            let destination = Destination::Site(backup.site.clone());
            if !backup.sync {
                let frame = self.encode_command(FrameKind::SingleMessage, NO_REQUEST_ID, command)?;
                if let Err(err) = self.route(destination, frame, flags).await {
                    warn!(site = %backup.site, error = %err, "asynchronous backup not sent");
                }
                continue;
            }

            let request_id = self.requests.new_request_id();
            let frame = self.encode_command(FrameKind::Request, request_id, command)?;
            let (request, handle) = Request::single_site(
                self.providers.clone(),
                request_id,
                backup.site.clone(),
                SingleResponseCollector::valid_only(),
            );
            if self.register(&request, backup.timeout) {
                trace!(request_id, site = %backup.site, command = command.name(), "backing up");
                if let Err(err) = self.route(destination, frame, flags).await {
                    request.cancel(err);
                }
            }
            pending.push((backup.site.clone(), handle));
        }
        Ok(BackupResponse::new(pending))
    }

    // ---------------------------------------------------------------------
    // Substrate entry points
    // ---------------------------------------------------------------------

    /// A view was installed by the substrate.
    ///
    /// Stale views, views with no members and views arriving after stop are
    /// ignored.
    pub fn on_view_change(&self, event: ViewEvent) {
        if event.members.is_empty() {
            debug!(view_id = event.view_id, "ignoring view without members");
            return;
        }
        if self.local_address.borrow().is_none() {
            *self.local_address.borrow_mut() = Some(self.channel.local_address());
        }

        let view = ClusterView::new(event.view_id, event.members.clone());
        let Some(previous) = self.views.install(view) else {
            debug!(
                view_id = event.view_id,
                current = self.views.current().view_id(),
                "ignoring stale view"
            );
            return;
        };
        let current = self.views.current();
        info!(
            view_id = current.view_id(),
            members = ?current.members().iter().map(Address::name).collect::<Vec<_>>(),
            merge = event.merge_subgroups.is_some(),
            "installed view"
        );

        self.addresses.refresh(current.members());
        if let Some(credits) = &self.credits {
            credits.retain_members(current.member_set());
        }

        // requests react on their own task, off the substrate's delivery path
        let weak = self.weak_self.clone();
        let members = current.member_set().clone();
        self.providers.task().spawn_task("view_changed", async move {
            if let Some(transport) = weak.upgrade() {
                transport.requests.view_changed(&members);
            }
        });

        let changed = ViewChangedEvent {
            view_id: current.view_id(),
            old_members: previous.members().to_vec(),
            new_members: current.members().to_vec(),
            local_address: self.address(),
        };
        let listeners = self.listeners.borrow().clone();
        for listener in listeners {
            match &event.merge_subgroups {
                Some(subgroups) => listener.merged(&changed, subgroups),
                None => listener.view_changed(&changed),
            }
        }
    }

    /// A message arrived from `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolDecode`] when the flags or the frame
    /// are malformed. Nothing of the message is processed in that case.
    pub fn on_message(
        &self,
        sender: Address,
        payload: &[u8],
        flags: MessageFlags,
    ) -> Result<(), TransportError> {
        let order = DeliverOrder::from_flags(flags).map_err(|err| {
            error!(sender = %sender, error = %err, "invalid delivery flags");
            TransportError::from(err)
        })?;
        let frame = decode_frame(payload).map_err(|err| {
            error!(sender = %sender, bytes = payload.len(), error = %err, "malformed frame");
            TransportError::from(err)
        })?;
        let sender = self.addresses.canonical(sender);

        if frame.kind == FrameKind::Batch {
            let frames = decode_batch(&frame.payload).map_err(|err| {
                error!(sender = %sender, error = %err, "malformed batch");
                TransportError::from(err)
            })?;
            trace!(sender = %sender, frames = frames.len(), "unpacking batch");
            for inner in frames {
                self.process_frame(&sender, inner, order);
            }
        } else {
            self.process_frame(&sender, frame, order);
        }
        Ok(())
    }

    /// Remote sites became reachable.
    pub fn on_site_up(&self, sites: &[String]) {
        let joined: Vec<String> = {
            let mut known = self.sites.borrow_mut();
            sites.iter().filter(|site| known.insert((*site).clone())).cloned().collect()
        };
        if joined.is_empty() {
            return;
        }
        info!(sites = ?joined, "sites up");
        let listeners = self.listeners.borrow().clone();
        for listener in listeners {
            listener.sites_changed(&joined, &[]);
        }
    }

    /// Remote sites became unreachable.
    ///
    /// Pending backups to those sites fail with
    /// [`TransportError::SiteUnreachable`].
    pub fn on_site_down(&self, sites: &[String]) {
        let left: Vec<String> = {
            let mut known = self.sites.borrow_mut();
            sites.iter().filter(|site| known.remove(*site)).cloned().collect()
        };
        for site in sites {
            self.requests.site_unreachable(site);
        }
        if left.is_empty() {
            return;
        }
        info!(sites = ?left, "sites down");
        let listeners = self.listeners.borrow().clone();
        for listener in listeners {
            listener.sites_changed(&[], &left);
        }
    }

    /// `source` granted `bytes` of credits, or the multicast pool when
    /// `None`. A no-op without flow control.
    pub fn on_credits(&self, source: Option<&Address>, bytes: u64) {
        let Some(credits) = &self.credits else {
            return;
        };
        let key =
            source.map_or(CreditKey::Multicast, |address| CreditKey::Unicast(address.clone()));
        trace!(?key, bytes, "credits replenished");
        credits.replenish(key, bytes);
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    fn process_frame(&self, sender: &Address, frame: Frame, order: DeliverOrder) {
        match frame.kind {
            FrameKind::Response => self.handle_response(sender, frame),
            FrameKind::Request => self.handle_command(sender, frame, order, true),
            FrameKind::SingleMessage => self.handle_command(sender, frame, order, false),
            FrameKind::Batch => {
                warn!(sender = %sender, "dropping nested batch");
            }
        }
    }

    fn handle_response(&self, sender: &Address, frame: Frame) {
        let Some(request) = self.requests.get(frame.request_id) else {
            trace!(request_id = frame.request_id, sender = %sender, "response for unknown request");
            return;
        };
        let response = match self.marshaller.decode::<Response<C::Value>>(&frame.payload) {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    request_id = frame.request_id,
                    sender = %sender,
                    error = %err,
                    "undecodable response"
                );
                Response::Exception(RemoteFailure {
                    kind: FailureKind::Decode,
                    message: err.to_string(),
                })
            }
        };
        request.on_response(sender, response);
    }

    fn handle_command(
        &self,
        sender: &Address,
        frame: Frame,
        order: DeliverOrder,
        expects_reply: bool,
    ) {
        let request_id = frame.request_id;
        if !self.running.get() {
            trace!(request_id, sender = %sender, "not running, rejecting command");
            if expects_reply {
                self.send_response(sender, request_id, Response::NotFound);
            }
            return;
        }

        let command: C = match self.marshaller.decode(&frame.payload) {
            Ok(command) => command,
            Err(err) => {
                warn!(request_id, sender = %sender, error = %err, "undecodable command");
                if expects_reply {
                    let failure = RemoteFailure {
                        kind: FailureKind::Decode,
                        message: err.to_string(),
                    };
                    self.send_response(sender, request_id, Response::Exception(failure));
                }
                return;
            }
        };

        let Some(handler) = self.handler.borrow().clone() else {
            debug!(request_id, sender = %sender, command = command.name(), "no inbound handler");
            if expects_reply {
                self.send_response(sender, request_id, Response::NotFound);
            }
            return;
        };

        let reply = if expects_reply {
            let weak = self.weak_self.clone();
            let origin = sender.clone();
            ReplyPromise::new(move |response: Response<C::Value>| {
                if let Some(transport) = weak.upgrade() {
                    transport.send_response(&origin, request_id, response);
                }
            })
        } else {
            ReplyPromise::detached()
        };

        trace!(request_id, sender = %sender, command = command.name(), %order, "received command");
        let chain = if command.is_non_blocking() {
            DeliverOrder::None
        } else {
            order
        };
        let origin = sender.clone();
        let job: LocalJob = Box::pin(async move {
            handler.handle(origin, command, reply, order).await;
        });
        self.inbound.execute(chain, sender, job);
    }

    fn encode_response(
        &self,
        request_id: RequestId,
        response: &Response<C::Value>,
    ) -> Result<Vec<u8>, TransportError> {
        let payload = self.marshaller.encode(response)?;
        encode_frame(FrameKind::Response, request_id, &payload).map_err(|err| {
            TransportError::Marshalling {
                message: err.to_string(),
            }
        })
    }

    fn send_response(&self, origin: &Address, request_id: RequestId, response: Response<C::Value>) {
        let frame = match self.encode_response(request_id, &response) {
            Ok(frame) => frame,
            Err(err) => {
                error!(
                    request_id,
                    origin = %origin,
                    error = %err,
                    "cannot marshal response, answering with the failure"
                );
                let fallback: Response<C::Value> = Response::Exception(RemoteFailure {
                    kind: FailureKind::Marshalling,
                    message: err.to_string(),
                });
                match self.encode_response(request_id, &fallback) {
                    Ok(frame) => frame,
                    Err(err) => {
                        error!(
                            request_id,
                            origin = %origin,
                            error = %err,
                            "cannot marshal failure response"
                        );
                        return;
                    }
                }
            }
        };
        // responses never wait behind other traffic
        let flags = DeliverOrder::None.to_flags();
        if let Err(err) = self.route_now(Destination::Member(origin.clone()), frame, flags) {
            debug!(request_id, origin = %origin, error = %err, "response not sent");
        }
    }

    // ---------------------------------------------------------------------
    // Outbound plumbing
    // ---------------------------------------------------------------------

    fn register<Co>(&self, request: &Rc<Request<P, C::Value, Co>>, timeout: Duration) -> bool
    where
        Co: ResponseCollector<C::Value> + 'static,
    {
        if !self.requests.add_request(request.clone()) {
            return false;
        }
        request.set_timeout(timeout);
        true
    }

    /// Deduplicate `targets`, dropping the local member unless `order` is
    /// total.
    fn remote_targets(&self, targets: &[Address], order: DeliverOrder) -> Vec<Address> {
        let local = self.local();
        let mut seen = HashSet::with_capacity(targets.len());
        targets
            .iter()
            .filter(|target| order.is_total() || **target != local)
            .filter(|target| seen.insert((*target).clone()))
            .cloned()
            .collect()
    }

    fn encode_command(
        &self,
        kind: FrameKind,
        request_id: RequestId,
        command: &C,
    ) -> Result<Vec<u8>, TransportError> {
        let payload = self.marshaller.encode(command).map_err(|err| {
            error!(command = command.name(), error = %err, "cannot marshal command");
            TransportError::from(err)
        })?;
        encode_frame(kind, request_id, &payload).map_err(|err| TransportError::Marshalling {
            message: err.to_string(),
        })
    }

    /// Send one frame to `targets`, the remote members of the view.
    async fn broadcast(
        &self,
        targets: &[Address],
        frame: Vec<u8>,
        order: DeliverOrder,
    ) -> Result<(), TransportError> {
        let flags = order.to_flags();
        match targets {
            [single] if !order.is_total() => {
                self.route(Destination::Member(single.clone()), frame, flags)
                    .await
            }
            _ if self.channel.is_multicast_capable() => {
                let flags = if order.is_total() {
                    flags
                } else {
                    flags | MessageFlags::DONT_LOOPBACK
                };
                self.route(Destination::All, frame, flags).await
            }
            _ if order.is_total() => {
                self.route(
                    Destination::Many(targets.to_vec()),
                    frame,
                    flags | MessageFlags::DONT_BUNDLE,
                )
                .await
            }
            _ => {
                for target in targets {
                    self.route(Destination::Member(target.clone()), frame.clone(), flags)
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Unicast each frame; a target that cannot be reached counts as gone.
    async fn fan_out(
        &self,
        request: &dyn PendingRequest<C::Value>,
        frames: impl Iterator<Item = (Address, Vec<u8>)>,
        flags: MessageFlags,
    ) {
        for (target, frame) in frames {
            if request.is_done() {
                break;
            }
            if let Err(err) = self.route(Destination::Member(target.clone()), frame, flags).await {
                debug!(
                    request_id = request.request_id(),
                    target = %target,
                    error = %err,
                    "send failed"
                );
                request.on_response(&target, Response::NotFound);
            }
        }
    }

    fn bundle_key(&self, destination: &Destination, flags: MessageFlags) -> Option<BundleKey> {
        if self.bundler.is_none()
            || !self.running.get()
            || flags.contains(MessageFlags::DONT_BUNDLE)
        {
            return None;
        }
        match destination {
            Destination::Member(address) => Some(BundleKey {
                destination: Some(address.clone()),
                flags,
            }),
            Destination::All => Some(BundleKey {
                destination: None,
                flags,
            }),
            Destination::Many(_) | Destination::Site(_) => None,
        }
    }

    /// Send from an application caller, which may wait for bundle space or
    /// credits.
    async fn route(
        &self,
        destination: Destination,
        frame: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<(), TransportError> {
        if let (Some(bundler), Some(key)) = (&self.bundler, self.bundle_key(&destination, flags)) {
            bundler.send(key, frame).await;
            return Ok(());
        }
        let permit = self.transmit(ExecutionContext::Blocking, destination, frame, flags)?;
        if !permit.wait().await {
            debug!("deferred send discarded before credits arrived");
        }
        Ok(())
    }

    /// Send from a delivery or timer path, which never waits.
    fn route_now(
        &self,
        destination: Destination,
        frame: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<(), TransportError> {
        if let (Some(bundler), Some(key)) = (&self.bundler, self.bundle_key(&destination, flags)) {
            bundler.send_non_blocking(key, frame);
            return Ok(());
        }
        self.transmit(ExecutionContext::NonBlocking, destination, frame, flags)
            .map(|_| ())
    }

    /// Hand a frame to the channel, through the credit map when flow control
    /// applies.
    fn transmit(
        &self,
        context: ExecutionContext,
        destination: Destination,
        frame: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<SendPermit, TransportError> {
        let metered = match (&self.credits, destination.credit_key()) {
            (Some(credits), Some(key)) if !flags.contains(MessageFlags::NO_FLOW_CONTROL) => {
                Some((credits, key))
            }
            _ => None,
        };
        let Some((credits, key)) = metered else {
            deliver(self.channel.as_ref(), &destination, frame, flags)?;
            return Ok(SendPermit::Sent);
        };

        let bytes = frame.len() as u64;
        let channel = self.channel.clone();
        Ok(credits.send(context, key, bytes, move || {
            if let Err(err) = deliver(channel.as_ref(), &destination, frame, flags) {
                warn!(?destination, error = %err, "metered send failed");
            }
        }))
    }
}

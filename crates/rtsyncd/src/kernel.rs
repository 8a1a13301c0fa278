//! Route and rule facade
//!
//! The operations the routing daemon calls: install, delete and replace
//! routes, dump foreign routes and local addresses, and drain kernel change
//! notifications into a [`ChangeMask`].

use crate::codec::{self, DumpKind, KernelRoute, RouteTarget};
use crate::config::RtsyncConfig;
use crate::error::Result;
use crate::netlink::{Connector, KernelConnector, Transport};
use crate::table::{RuleInstaller, TableAllocator};
use crate::types::{AddressFilter, ChangeMask, DumpResult, ObservedRule, RouteOp, RouteOrigin, RouteRecord};
use netlink_packet_route::RouteNetlinkMessage;
use rtsync_types::{Family, IpPrefix};
use std::os::fd::RawFd;
use tracing::{debug, info, instrument, trace, warn};

/// Receives the result of a notification drain
pub trait ChangeHandler {
    /// Whether link changes on `name` matter to the daemon.
    fn is_tracked_link(&self, _name: &str) -> bool {
        true
    }

    /// Called at most once per drain, with a non-empty mask.
    fn on_change(&mut self, mask: ChangeMask);
}

impl<F: FnMut(ChangeMask)> ChangeHandler for F {
    fn on_change(&mut self, mask: ChangeMask) {
        self(mask)
    }
}

/// Policy rules installed through the command channel
/// Rule changes sent over the command channel, tagged with our protocol
struct CommandRules<'a, C: Connector>(&'a mut Transport<C>, u8);

impl<C: Connector> RuleInstaller for CommandRules<'_, C> {
    fn add_rule(&mut self, priority: u32, src: &IpPrefix, table: u32) -> Result<()> {
        debug!(priority, %src, table, "Add rule");
        self.0.talk(codec::rule_add_request(priority, src, table, self.1))
    }

    fn flush_rule(&mut self, priority: u32, family: Family) -> Result<()> {
        debug!(priority, %family, "Flush rule");
        self.0.talk(codec::rule_flush_request(priority, family))
    }
}

/// Which kernel routes count as foreign
#[derive(Debug, Clone)]
struct RouteFilter {
    protocol: u8,
    import_tables: Vec<u32>,
}

impl RouteFilter {
    fn is_own(&self, route: &KernelRoute) -> bool {
        route.record.origin == RouteOrigin::Protocol(self.protocol)
    }

    /// Routes installed by someone else into an imported table, excluding
    /// cache entries, martians and unreachable defaults.
    fn accepts_foreign(&self, route: &KernelRoute) -> bool {
        let record = &route.record;
        if self.is_own(route) || route.cloned {
            return false;
        }
        if !self.import_tables.contains(&route.table) {
            trace!(table = route.table, dest = %record.dest, "Route not in an imported table");
            return false;
        }
        if record.dest.is_martian() || record.src.is_some_and(|s| s.is_martian()) {
            return false;
        }
        !record.is_unreachable_default()
    }
}

/// Kernel routing table and policy rule synchronization
pub struct KernelRouting<C: Connector = KernelConnector> {
    transport: Transport<C>,
    allocator: TableAllocator,
    filter: RouteFilter,
    source_specific: bool,
}

impl KernelRouting<KernelConnector> {
    /// Open the command channel to the kernel.
    pub fn open(config: &RtsyncConfig) -> Result<Self> {
        let connector = KernelConnector::new(config.netlink.recv_buffer_size);
        let mut routing = Self::new(config, connector);
        routing.setup()?;
        Ok(routing)
    }
}

impl<C: Connector> KernelRouting<C> {
    pub fn new(config: &RtsyncConfig, connector: C) -> Self {
        Self {
            transport: Transport::new(connector, config.wait_timeout()),
            allocator: TableAllocator::from_config(config),
            filter: RouteFilter {
                protocol: config.netlink.protocol,
                import_tables: config.tables.import_tables.clone(),
            },
            source_specific: config.source.enabled,
        }
    }

    /// Open the command channel.
    pub fn setup(&mut self) -> Result<()> {
        self.transport.open_command()
    }

    /// Open the listen channel.
    pub fn setup_listener(&mut self) -> Result<()> {
        self.transport.open_listen()
    }

    /// Descriptor to poll for pending notifications.
    pub fn listen_fd(&self) -> Option<RawFd> {
        self.transport.listen_fd()
    }

    /// Identifies the current listen channel; see [`Transport::listen_generation`].
    pub fn listen_generation(&self) -> u64 {
        self.transport.listen_generation()
    }

    pub fn allocator(&self) -> &TableAllocator {
        &self.allocator
    }

    pub fn transport(&self) -> &Transport<C> {
        &self.transport
    }

    /// Install or remove `route`.
    ///
    /// Family disagreement is rejected before anything is sent, and an
    /// unreachable default route is silently accepted without a kernel call.
    #[instrument(skip(self), fields(route = %route))]
    pub fn change_route(&mut self, op: RouteOp, route: &RouteRecord) -> Result<()> {
        route.check_family()?;

        if route.is_unreachable_default() {
            debug!("Ignoring unreachable default route");
            return Ok(());
        }

        let src = if self.source_specific { route.source() } else { None };
        let table = self
            .allocator
            .resolve(src, &mut CommandRules(&mut self.transport, self.filter.protocol))?;
        let target = RouteTarget {
            table,
            protocol: self.filter.protocol,
            with_source: src.is_some_and(|s| s.is_ipv6()) && self.allocator.ipv6_subtrees(),
        };

        debug!(?op, table, "Route change");
        self.transport
            .talk(codec::route_request(op, route, &target))
    }

    pub fn add_route(&mut self, route: &RouteRecord) -> Result<()> {
        self.change_route(RouteOp::Add, route)
    }

    pub fn delete_route(&mut self, route: &RouteRecord) -> Result<()> {
        self.change_route(RouteOp::Delete, route)
    }

    /// Move `old` to the next hop, interface and metric of `new`.
    ///
    /// A no-op when those are unchanged. Otherwise the old route is deleted
    /// and the new one added as two separate requests; the add finding the
    /// route already present counts as success.
    #[instrument(skip(self), fields(old = %old, new = %new))]
    pub fn replace_route(&mut self, old: &RouteRecord, new: &RouteRecord) -> Result<()> {
        if old.same_forwarding(new) && old.dest == new.dest && old.src == new.src {
            trace!("Route unchanged");
            return Ok(());
        }
        old.check_family()?;
        new.check_family()?;

        if let Err(e) = self.delete_route(old) {
            debug!(error = %e, "Deleting replaced route failed");
        }

        match self.add_route(new) {
            Err(e) if e.is_exists() => {
                debug!("Replacement route already present");
                Ok(())
            }
            other => other,
        }
    }

    /// Routes installed by others in the imported tables, IPv6 first.
    ///
    /// At most `max` records are returned; `found` counts every match. Each
    /// family's route dump is followed by a rule dump that reconciles the
    /// source table rules.
    #[instrument(skip(self))]
    pub fn dump_routes(&mut self, max: usize) -> Result<DumpResult> {
        let mut dump = DumpResult::with_capacity(max);

        for family in Family::ALL {
            let filter = &self.filter;
            self.transport
                .dump(codec::dump_request(DumpKind::Routes, Some(family)), |msg| {
                    let Some(route) = decode_route_message(msg)? else {
                        return Ok(0);
                    };
                    if !filter.accepts_foreign(&route) {
                        return Ok(0);
                    }
                    trace!(route = %route.record, table = route.table, "Found kernel route");
                    dump.push(route.record, max);
                    Ok(1)
                })?;

            if self.source_specific {
                self.reconcile_rules(family)?;
            }
        }

        debug!(found = dump.found, kept = dump.records.len(), "Dumped kernel routes");
        Ok(dump)
    }

    /// Routes carrying our own protocol tag, in any table.
    #[instrument(skip(self))]
    pub fn dump_installed_routes(&mut self, max: usize) -> Result<DumpResult> {
        let mut dump = DumpResult::with_capacity(max);

        for family in Family::ALL {
            let filter = &self.filter;
            self.transport
                .dump(codec::dump_request(DumpKind::Routes, Some(family)), |msg| {
                    let Some(route) = decode_route_message(msg)? else {
                        return Ok(0);
                    };
                    if !filter.is_own(&route) || route.cloned {
                        return Ok(0);
                    }
                    dump.push(route.record, max);
                    Ok(1)
                })?;
        }

        Ok(dump)
    }

    /// Dump the kernel's rules for `family` and bring them in line with the
    /// allocator. Returns the number of rules reinstalled.
    #[instrument(skip(self))]
    pub fn reconcile_rules(&mut self, family: Family) -> Result<usize> {
        let mut observed: Vec<ObservedRule> = Vec::new();
        self.transport
            .dump(codec::dump_request(DumpKind::Rules, Some(family)), |msg| {
                if let RouteNetlinkMessage::NewRule(rule) = msg {
                    if let Some(rule) = codec::decode_rule(rule)? {
                        observed.push(rule);
                        return Ok(1);
                    }
                }
                Ok(0)
            })?;

        trace!(rules = observed.len(), %family, "Dumped kernel rules");
        Ok(self
            .allocator
            .reconcile(&observed, family, &mut CommandRules(&mut self.transport, self.filter.protocol)))
    }

    /// Interface addresses as host route records.
    #[instrument(skip(self))]
    pub fn dump_addresses(&mut self, filter: AddressFilter, max: usize) -> Result<DumpResult> {
        let mut dump = DumpResult::with_capacity(max);

        self.transport
            .dump(codec::dump_request(DumpKind::Addresses, None), |msg| {
                let RouteNetlinkMessage::NewAddress(addr) = msg else {
                    return Ok(0);
                };
                let Some(addr) = codec::decode_address(addr)? else {
                    return Ok(0);
                };
                if filter.ifindex.is_some_and(|i| i != addr.ifindex) {
                    return Ok(0);
                }
                let host = IpPrefix::host(addr.address);
                if host.is_link_local() != filter.link_local {
                    return Ok(0);
                }
                if !filter.link_local && host.is_martian() {
                    return Ok(0);
                }
                trace!(ifindex = addr.ifindex, address = %addr.address, "Found address");
                dump.push(addr.to_record(), max);
                Ok(1)
            })?;

        Ok(dump)
    }

    /// Read every pending notification and report what changed.
    ///
    /// The handler is called once if anything relevant changed. When the
    /// listen channel fails it is reopened and every change bit is
    /// reported, since notifications may have been lost.
    #[instrument(skip_all)]
    pub fn drain_changes<H>(&mut self, handler: &mut H) -> Result<ChangeMask>
    where
        H: ChangeHandler + ?Sized,
    {
        self.transport.open_listen()?;

        let mut mask = ChangeMask::empty();
        let filter = &self.filter;
        let allocator = &self.allocator;
        let tracked = &*handler;
        let result = self.transport.drain_listen(|msg| {
            let changed = classify_notification(msg, filter, allocator, tracked);
            if !changed.is_empty() {
                mask |= changed;
                return Ok(1);
            }
            Ok(0)
        });

        match result {
            Ok(_) => {}
            Err(e) if e.is_channel_fatal() => {
                warn!(error = %e, "Listen channel failed, reporting all changes");
                mask = ChangeMask::all();
                if let Err(e) = self.transport.open_listen() {
                    warn!(error = %e, "Cannot reopen listen channel");
                }
            }
            Err(e) => return Err(e),
        }

        if !mask.is_empty() {
            debug!(%mask, "Kernel tables changed");
            handler.on_change(mask);
        }
        Ok(mask)
    }

    /// Flush every allocated rule and close both channels.
    #[instrument(skip(self))]
    pub fn teardown(&mut self) {
        self.allocator
            .teardown(&mut CommandRules(&mut self.transport, self.filter.protocol));
        self.transport.close_listen();
        self.transport.close_command();
        info!("Kernel routing released");
    }
}

fn decode_route_message(msg: &RouteNetlinkMessage) -> Result<Option<KernelRoute>> {
    match msg {
        RouteNetlinkMessage::NewRoute(route) => codec::decode_route(route),
        _ => Ok(None),
    }
}

/// Change bit a notification contributes, if it is relevant.
fn classify_notification<H>(
    msg: &RouteNetlinkMessage,
    filter: &RouteFilter,
    allocator: &TableAllocator,
    handler: &H,
) -> ChangeMask
where
    H: ChangeHandler + ?Sized,
{
    match msg {
        RouteNetlinkMessage::NewRoute(route) | RouteNetlinkMessage::DelRoute(route) => {
            match codec::decode_route(route) {
                Ok(Some(route)) if filter.accepts_foreign(&route) => ChangeMask::ROUTE,
                Ok(_) => ChangeMask::empty(),
                Err(e) => {
                    warn!(error = %e, "Undecodable route notification");
                    ChangeMask::empty()
                }
            }
        }
        RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::DelLink(link) => {
            match codec::link_name(link) {
                Some(name) if handler.is_tracked_link(name) => {
                    trace!(name, index = link.header.index, "Link change");
                    ChangeMask::LINK
                }
                _ => ChangeMask::empty(),
            }
        }
        RouteNetlinkMessage::NewAddress(addr) | RouteNetlinkMessage::DelAddress(addr) => {
            match codec::decode_address(addr) {
                Ok(Some(_)) => ChangeMask::ADDRESS,
                Ok(None) => ChangeMask::empty(),
                Err(e) => {
                    warn!(error = %e, "Undecodable address notification");
                    ChangeMask::empty()
                }
            }
        }
        RouteNetlinkMessage::NewRule(rule) | RouteNetlinkMessage::DelRule(rule) => {
            match codec::decode_rule(rule) {
                Ok(Some(rule)) if touches_allocator(&rule, allocator) => ChangeMask::RULE,
                Ok(_) => ChangeMask::empty(),
                Err(e) => {
                    warn!(error = %e, "Undecodable rule notification");
                    ChangeMask::empty()
                }
            }
        }
        other => {
            trace!(message = ?other, "Unexpected notification");
            ChangeMask::empty()
        }
    }
}

/// A rule change in the allocator's priority range.
fn touches_allocator(rule: &ObservedRule, allocator: &TableAllocator) -> bool {
    let Some(priority) = rule.priority else {
        return false;
    };
    if rule.src.is_some_and(|s| s.is_martian()) {
        return false;
    }
    let first = allocator.priority_of(0);
    priority >= first && priority - first < allocator.capacity() as u32
}

impl<C: Connector> Drop for KernelRouting<C> {
    fn drop(&mut self) {
        if !self.allocator.is_empty() {
            warn!(tables = self.allocator.len(), "Dropping kernel routing without teardown");
        }
    }
}

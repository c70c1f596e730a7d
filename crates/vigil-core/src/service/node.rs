// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service tree node and the lifecycle algorithms that run over it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all, try_join_all};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::deps::{self, Dep, Dependency};
use super::{Service, ServiceState};
use crate::bus::{Handler, NotificationBus, SubscriptionId};
use crate::error::{Error, Result};
use crate::sync::lock;

/// Outcome of a start, shared by every caller awaiting it.
pub type StartFuture = Shared<BoxFuture<'static, Result<()>>>;

/// A node in the supervision tree.
///
/// Nodes are always handled through `Arc`. Children are owned; parent and
/// dependency links are weak.
pub struct ServiceNode {
    name: String,
    service: Arc<dyn Service>,
    bus: Arc<NotificationBus>,
    this: Weak<ServiceNode>,
    parent: Mutex<Weak<ServiceNode>>,
    children: Mutex<Vec<Arc<ServiceNode>>>,
    dependencies: Mutex<Vec<Dependency>>,
    state: watch::Sender<ServiceState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    started: Mutex<Option<StartFuture>>,
    restarting: AtomicBool,
}

impl std::fmt::Debug for ServiceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceNode")
            .field("name", &self.name)
            .field("state", &self.state())
            .field(
                "children",
                &self.children().iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ServiceNode {
    /// Wrap a service in a detached node.
    pub fn new(service: Arc<dyn Service>, bus: Arc<NotificationBus>) -> Arc<Self> {
        let name = service.name();
        Arc::new_cyclic(|this| Self {
            name,
            service,
            bus,
            this: this.clone(),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            dependencies: Mutex::new(Vec::new()),
            state: watch::Sender::new(ServiceState::Stopped),
            subscriptions: Mutex::new(Vec::new()),
            started: Mutex::new(None),
            restarting: AtomicBool::new(false),
        })
    }

    // ======================================================================
    // Tree assembly
    // ======================================================================

    /// Attach `child` as an owned child with the given dependencies.
    pub fn add_child(
        &self,
        child: Arc<ServiceNode>,
        deps: impl IntoIterator<Item = Dep>,
    ) -> Result<Arc<ServiceNode>> {
        if Arc::ptr_eq(&child, &self.handle()?) {
            return Err(Error::Configuration(format!(
                "{} cannot be its own child",
                self.name
            )));
        }
        if child.parent().is_some() {
            return Err(Error::Configuration(format!(
                "{} is already attached to a parent",
                child.name
            )));
        }

        {
            let mut children = lock(&self.children);
            if children.iter().any(|c| c.name == child.name) {
                return Err(Error::Configuration(format!(
                    "{} already has a child named {}",
                    self.name, child.name
                )));
            }
            children.push(child.clone());
        }

        *lock(&child.parent) = self.this.clone();
        child.add_dependency(deps);
        trace!(parent = %self.name, child = %child.name, "child attached");
        Ok(child)
    }

    /// Create a node for `service` on this node's bus and attach it.
    pub fn add_service(
        &self,
        service: Arc<dyn Service>,
        deps: impl IntoIterator<Item = Dep>,
    ) -> Result<Arc<ServiceNode>> {
        self.add_child(ServiceNode::new(service, self.bus.clone()), deps)
    }

    /// Declare more dependencies. Names resolve against siblings at start.
    pub fn add_dependency(&self, deps: impl IntoIterator<Item = Dep>) {
        lock(&self.dependencies).extend(deps.into_iter().map(Dependency::from));
    }

    /// Resolve every declared dependency to a node, caching name lookups.
    pub(crate) fn resolve_dependencies(&self) -> Result<Vec<Arc<ServiceNode>>> {
        let mut declared = lock(&self.dependencies);
        let mut resolved = Vec::with_capacity(declared.len());

        for dep in declared.iter_mut() {
            let node = match dep {
                Dependency::Resolved { name, node } => node
                    .upgrade()
                    .ok_or_else(|| deps::unresolved(&self.name, name))?,
                Dependency::Unresolved(name) => {
                    let name = name.clone();
                    let sibling = self
                        .sibling(&name)
                        .ok_or_else(|| deps::unresolved(&self.name, &name))?;
                    *dep = Dependency::Resolved {
                        name,
                        node: Arc::downgrade(&sibling),
                    };
                    sibling
                }
            };
            resolved.push(node);
        }

        Ok(resolved)
    }

    /// Names of the declared dependencies, in declaration order.
    pub fn dependency_names(&self) -> Vec<String> {
        lock(&self.dependencies)
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    // ======================================================================
    // Tree queries
    // ======================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Wait until the node reaches `wanted`.
    pub async fn wait_for_state(&self, wanted: ServiceState) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only ends on a match
        let _ = rx.wait_for(|s| *s == wanted).await;
    }

    /// Strong handle to this node.
    pub fn handle(&self) -> Result<Arc<ServiceNode>> {
        self.this
            .upgrade()
            .ok_or_else(|| Error::Configuration(format!("{} is being dropped", self.name)))
    }

    pub fn parent(&self) -> Option<Arc<ServiceNode>> {
        lock(&self.parent).upgrade()
    }

    /// Children in insertion order.
    pub fn children(&self) -> Vec<Arc<ServiceNode>> {
        lock(&self.children).clone()
    }

    pub fn child(&self, name: &str) -> Option<Arc<ServiceNode>> {
        lock(&self.children).iter().find(|c| c.name == name).cloned()
    }

    /// Other children of this node's parent.
    pub fn siblings(&self) -> Vec<Arc<ServiceNode>> {
        self.parent()
            .map(|p| {
                p.children()
                    .into_iter()
                    .filter(|c| c.name != self.name)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn sibling(&self, name: &str) -> Option<Arc<ServiceNode>> {
        if name == self.name {
            return None;
        }
        self.parent().and_then(|p| p.child(name))
    }

    /// Every node below this one, depth first.
    pub fn descendants(&self) -> Vec<Arc<ServiceNode>> {
        let mut out = Vec::new();
        let mut stack: Vec<Arc<ServiceNode>> = self.children().into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            stack.extend(node.children().into_iter().rev());
            out.push(node);
        }
        out
    }

    // ======================================================================
    // Bus access
    // ======================================================================

    /// Subscribe on behalf of this node; released on stop.
    pub fn subscribe(&self, topic: &str, handler: Handler) -> SubscriptionId {
        let id = self.bus.subscribe(topic, handler);
        lock(&self.subscriptions).push(id);
        id
    }

    /// Priority variant of [`subscribe`](Self::subscribe).
    pub fn subscribe_with_priority(
        &self,
        topic: &str,
        handler: Handler,
        priority: i32,
    ) -> SubscriptionId {
        let id = self.bus.subscribe_with_priority(topic, handler, priority);
        lock(&self.subscriptions).push(id);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.subscriptions).retain(|owned| *owned != id);
        self.bus.unsubscribe_id(id)
    }

    /// Release every subscription owned by this node.
    pub fn unsubscribe_all(&self) -> usize {
        let owned: Vec<SubscriptionId> = lock(&self.subscriptions).drain(..).collect();
        owned
            .into_iter()
            .filter(|id| self.bus.unsubscribe_id(*id))
            .count()
    }

    /// Number of live subscriptions owned by this node.
    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    /// Publish with this node as the publisher.
    pub async fn publish(&self, topic: &str, args: Vec<Value>) -> Result<Option<Value>> {
        self.bus.publish(topic, args, Some(&self.name)).await
    }

    // ======================================================================
    // Lifecycle
    // ======================================================================

    /// Start the node, its dependencies and its children.
    ///
    /// Idempotent: callers that overlap, or that arrive after the start
    /// finished, get the same outcome. A failed start stays failed until
    /// [`restart`](Self::restart).
    pub fn start(&self) -> StartFuture {
        let mut started = lock(&self.started);
        if let Some(in_flight) = started.as_ref() {
            return in_flight.clone();
        }

        let outcome = match self.handle() {
            Ok(node) => node.run_start().boxed().shared(),
            Err(e) => futures::future::ready(Err(e)).boxed().shared(),
        };
        *started = Some(outcome.clone());
        outcome
    }

    async fn run_start(self: Arc<Self>) -> Result<()> {
        self.set_state(ServiceState::Starting);

        match self.start_sequence().await {
            Ok(()) => {
                self.set_state(ServiceState::Running);
                debug!(service = %self.name, "running");
                Ok(())
            }
            Err(e) => {
                error!(service = %self.name, error = %e, "failed to start");
                self.set_state(ServiceState::Failed);
                Err(e)
            }
        }
    }

    async fn start_sequence(self: &Arc<Self>) -> Result<()> {
        let deps = self.resolve_dependencies()?;
        if let Some(cycle) = deps::find_cycle(self)? {
            let parent = self
                .parent()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| self.name.clone());
            return Err(Error::DependencyCycle { parent, cycle });
        }

        try_join_all(deps.iter().map(|d| d.start())).await?;

        self.service
            .initialize(self)
            .await
            .map_err(|e| Error::hook(&self.name, "initialize", e))?;

        if !self.service.silent() {
            info!(service = %self.name, "{}", self.service.start_message());
        }

        let children = self.children();
        try_join_all(children.iter().map(|c| c.start())).await?;
        Ok(())
    }

    /// Stop children (dependents first), run `destroy`, release this node's
    /// subscriptions. No-op when the node was never started.
    pub fn stop(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            let Some(in_flight) = lock(&self.started).take() else {
                return Ok(());
            };
            // Let a start that is still running settle before tearing down
            let _ = in_flight.await;

            self.set_state(ServiceState::Stopping);
            let mut first_error: Option<Error> = None;

            for layer in deps::stop_layers(&self.children()) {
                for result in join_all(layer.iter().map(|c| c.stop())).await {
                    if let Err(e) = result {
                        first_error.get_or_insert(e);
                    }
                }
            }

            if let Err(e) = self.service.destroy(self).await {
                first_error.get_or_insert(Error::hook(&self.name, "destroy", e));
            }

            let released = self.unsubscribe_all();
            trace!(service = %self.name, released, "subscriptions released");

            match first_error {
                None => {
                    self.set_state(ServiceState::Stopped);
                    debug!(service = %self.name, "stopped");
                    Ok(())
                }
                Some(e) => {
                    warn!(service = %self.name, error = %e, "stop failed");
                    self.set_state(ServiceState::Failed);
                    Err(e)
                }
            }
        }
        .boxed()
    }

    /// `stop()` then `start()`. A second restart while one is running is
    /// rejected.
    pub async fn restart(&self) -> Result<()> {
        if self.restarting.swap(true, Ordering::SeqCst) {
            return Err(Error::RestartInProgress(self.name.clone()));
        }
        let _guard = RestartGuard(&self.restarting);

        info!(service = %self.name, "restarting");
        self.stop().await?;
        self.start().await
    }

    /// True while [`restart`](Self::restart) is running.
    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    /// Probe this node and, concurrently, its whole subtree.
    ///
    /// Each node routes a failure of its own probe or of its subtree through
    /// the service's `recover` hook before passing it up.
    pub fn check_health(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        async move {
            let children = self.children();
            let (own, subtree) = futures::join!(
                self.probe(timeout),
                try_join_all(children.iter().map(|c| c.check_health(timeout)))
            );

            match own.and(subtree.map(|_| ())) {
                Ok(()) => Ok(()),
                Err(e) => self.handle_error(e).await,
            }
        }
        .boxed()
    }

    async fn probe(&self, timeout: Duration) -> Result<()> {
        match self.state() {
            ServiceState::Running => {}
            ServiceState::Failed => return Err(Error::NotStarted(self.name.clone())),
            other => {
                trace!(service = %self.name, state = %other, "health probe skipped");
                return Ok(());
            }
        }

        match tokio::time::timeout(timeout, self.service.health(self, timeout)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::hook(&self.name, "health", e)),
            Err(_) => Err(Error::HealthCheckTimeout {
                service: self.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Offer `error` to the service's `recover` hook; rethrow unless handled.
    pub async fn handle_error(&self, error: Error) -> Result<()> {
        if self.service.recover(self, &error).await {
            info!(service = %self.name, error = %error, "recovered");
            Ok(())
        } else {
            Err(error)
        }
    }

    fn set_state(&self, next: ServiceState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            trace!(service = %self.name, from = %previous, to = %next, "state change");
        }
    }
}

struct RestartGuard<'a>(&'a AtomicBool);

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

//! Leader election over a `coordination.k8s.io/v1` Lease.
//!
//! Only the instance holding the lease reconciles clusters. The Lease API alone does not
//! guarantee that a single instance acts as leader at any point in time, so every mutation made
//! by the controller is preceded by a `LeaseFence::check`. As long as all instances follow this
//! protocol, a deposed leader can not act on stale leadership for longer than a single call.
//!
//! The acquire and renew protocol follows the one of client-go's `leaderelection` package.

use std::time::Duration as StdDuration;

use anyhow::{bail, ensure, Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::prelude::*;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Event, Result as WatcherResult};
use maplit::btreemap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;

use crate::k8s::api_result;
use quorum_core::{LABEL_APP_VALUE, LABEL_CONTROLLED_BY, LABEL_CONTROLLED_BY_VALUE, LABEL_K8S_APP};

/// Renew deadlines must exceed the retry period by at least this factor.
const JITTER_FACTOR: f64 = 1.2;

pub(crate) const METRIC_IS_LEADER: &str = "quorum_operator_is_leader";
pub(crate) const METRIC_LEADERSHIP_CHANGES: &str = "quorum_operator_leadership_changes";

/// The leadership state of this instance.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaderState {
    /// This instance holds the lease.
    Leading,
    /// The lease is held by the instance with the given identity.
    Following(String),
    /// The lease state is unknown, e.g. while starting up or after failing to renew.
    Standby,
}

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// The name of the lease object.
    pub name: String,
    /// The namespace of the lease object.
    pub namespace: String,
    /// The identity written to the lease when it is acquired, the name of this pod.
    pub identity: String,
    /// How long followers wait without observing a lease change before taking over.
    pub lease_duration: Duration,
    /// How often the leader renews the lease.
    pub renew_deadline: Duration,
    /// The delay between retries of failed lease calls.
    pub retry_period: Duration,
    /// The deadline of each lease API call.
    pub api_timeout: StdDuration,
}

impl LeaderElectionConfig {
    /// Create a new instance, validating the given durations.
    pub fn new(
        namespace: impl Into<String>, name: impl Into<String>, identity: impl Into<String>, lease_duration: Duration, renew_deadline: Duration,
        retry_period: Duration, api_timeout: StdDuration,
    ) -> Result<Self> {
        ensure!(lease_duration > renew_deadline, "lease duration must be greater than the renew deadline");
        ensure!(
            renew_deadline.num_milliseconds() as f64 > JITTER_FACTOR * retry_period.num_milliseconds() as f64,
            "renew deadline must be greater than the retry period * {}",
            JITTER_FACTOR
        );
        ensure!(retry_period.num_seconds() >= 1, "retry period must be at least 1 second");
        Ok(Self {
            name: name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration,
            renew_deadline,
            retry_period,
            api_timeout,
        })
    }

    /// The lease to create when none exists yet, held by this instance.
    pub fn initial_lease(&self) -> Lease {
        let now = Utc::now();
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(btreemap! {
                    LABEL_K8S_APP.into() => LABEL_APP_VALUE.into(),
                    LABEL_CONTROLLED_BY.into() => LABEL_CONTROLLED_BY_VALUE.into(),
                }),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                acquire_time: Some(MicroTime(now)),
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.num_seconds() as i32),
                lease_transitions: Some(0),
                renew_time: Some(MicroTime(now)),
            }),
        }
    }

    /// A fence checking leadership against the lease of this config.
    pub fn fence(&self, client: Client) -> LeaseFence {
        LeaseFence {
            api: Api::namespaced(client, &self.namespace),
            name: self.name.clone(),
            identity: self.identity.clone(),
            api_timeout: self.api_timeout,
        }
    }
}

/// The state to move to after observing the given lease holder, if it changed.
pub fn next_state(current: &LeaderState, holder: &str, identity: &str) -> Option<LeaderState> {
    let holds_lease = holder == identity;
    match current {
        LeaderState::Leading if holds_lease => None,
        LeaderState::Following(leader) if leader == holder => None,
        _ if holds_lease => Some(LeaderState::Leading),
        _ => Some(LeaderState::Following(holder.to_string())),
    }
}

/// The holder identity recorded in the given lease, empty if none.
fn lease_holder(lease: &Lease) -> &str {
    lease
        .spec
        .as_ref()
        .and_then(|spec| spec.holder_identity.as_deref())
        .unwrap_or_default()
}

/// A task acquiring and renewing the operator's lease.
pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaderElectionConfig,
    state_tx: watch::Sender<LeaderState>,
    state: LeaderState,
    shutdown: BroadcastStream<()>,

    /// The lease as last observed from the API.
    last_observed_lease: Lease,
    /// The last time a change to the lease was observed.
    last_observed_change: DateTime<Utc>,
}

impl LeaderElector {
    /// Create a new instance along with a receiver of its state.
    pub fn new(config: LeaderElectionConfig, client: Client, shutdown: broadcast::Receiver<()>) -> (Self, watch::Receiver<LeaderState>) {
        metrics::register_gauge!(
            METRIC_IS_LEADER,
            metrics::Unit::Count,
            "a gauge indicating if this instance is the leader, where 1.0 indicates leadership"
        );
        metrics::register_gauge!(METRIC_LEADERSHIP_CHANGES, metrics::Unit::Count, "the number of lease transitions observed");
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        let elector = Self {
            api: Api::namespaced(client, &config.namespace),
            last_observed_lease: config.initial_lease(),
            last_observed_change: Utc::now(),
            config,
            state_tx,
            state: LeaderState::Standby,
            shutdown: BroadcastStream::new(shutdown),
        };
        (elector, state_rx)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(lease = %self.config.name, "leader elector started");
        let lease_watcher = watcher(
            self.api.clone(),
            ListParams {
                field_selector: Some(format!("metadata.name={}", self.config.name)),
                ..Default::default()
            },
        );
        tokio::pin!(lease_watcher);

        let mut delay_for = StdDuration::from_secs(0);
        loop {
            let delay = tokio::time::sleep(delay_for);
            tokio::pin!(delay);
            tokio::select! {
                Some(res) = lease_watcher.next() => self.handle_lease_event(res),
                _ = &mut delay => {
                    if let Err(err) = self.try_acquire_or_renew().await {
                        tracing::error!(error = ?err, "error acquiring or renewing lease");
                        if self.state != LeaderState::Standby {
                            self.set_state(LeaderState::Standby);
                        }
                        self.last_observed_change = Utc::now();
                        delay_for = self.config.retry_period.to_std().unwrap_or(StdDuration::from_secs(2));
                        continue;
                    }
                }
                _ = self.shutdown.next() => break,
            }
            delay_for = self.next_attempt_in();
        }

        self.set_state(LeaderState::Standby);
        tracing::info!("leader elector stopped");
    }

    /// Handle an event from the lease watcher.
    fn handle_lease_event(&mut self, res: WatcherResult<Event<Lease>>) {
        let lease = match res {
            Ok(Event::Applied(lease)) => lease,
            Ok(_) => return,
            Err(err) => {
                tracing::error!(error = ?err, "error from lease watcher");
                return;
            }
        };
        if lease != self.last_observed_lease {
            tracing::debug!("lease change observed from watcher");
            self.last_observed_change = Utc::now();
            self.observe(lease);
        }
    }

    /// Fetch the lease, creating it if it does not exist.
    async fn fetch_or_create_lease(&mut self) -> Result<()> {
        let now = Utc::now();
        let fetched = timeout(self.config.api_timeout, self.api.get(&self.config.name))
            .await
            .context("timeout fetching lease")?;
        let lease = match fetched {
            Ok(lease) => lease,
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => {
                tracing::info!(lease = %self.config.name, "creating lease");
                timeout(self.config.api_timeout, self.api.create(&Default::default(), &self.config.initial_lease()))
                    .await
                    .context("timeout creating lease")?
                    .context("error creating lease")?
            }
            Err(err) => return Err(err).context("error fetching lease"),
        };
        if lease != self.last_observed_lease {
            self.last_observed_change = now;
            self.observe(lease);
        }
        Ok(())
    }

    /// Attempt to acquire the lease, or renew it when already held.
    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        self.fetch_or_create_lease().await?;

        let now = Utc::now();
        if let LeaderState::Following(leader) = &self.state {
            if self.last_observed_change + self.config.lease_duration > now {
                tracing::debug!(%leader, "lease is held and has not yet expired");
                return Ok(());
            }
            tracing::info!(%leader, "lease has expired, attempting to take over");
        }

        let mut lease = self.last_observed_lease.clone();
        let spec = lease.spec.get_or_insert_with(Default::default);
        spec.lease_duration_seconds = Some(self.config.lease_duration.num_seconds() as i32);
        spec.renew_time = Some(MicroTime(now));
        if self.state != LeaderState::Leading {
            spec.holder_identity = Some(self.config.identity.clone());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.map(|val| val + 1).unwrap_or(0));
        }
        lease.metadata.managed_fields = None;

        // The resource version carried along makes the server reject writes based on a stale lease.
        let mut params = PatchParams::apply(&self.config.identity);
        params.force = true;
        let lease = timeout(self.config.api_timeout, self.api.patch(&self.config.name, &params, &Patch::Apply(lease)))
            .await
            .context("timeout updating lease")?
            .context("error updating lease")?;
        self.last_observed_change = now;
        self.observe(lease);
        Ok(())
    }

    /// Record the given lease as the last observed one, updating the leadership state.
    fn observe(&mut self, lease: Lease) {
        if let Some(transitions) = lease.spec.as_ref().and_then(|spec| spec.lease_transitions) {
            metrics::gauge!(METRIC_LEADERSHIP_CHANGES, transitions as f64);
        }
        if let Some(state) = next_state(&self.state, lease_holder(&lease), &self.config.identity) {
            self.set_state(state);
        }
        self.last_observed_lease = lease;
    }

    /// The delay before the next attempt to acquire or renew the lease.
    fn next_attempt_in(&self) -> StdDuration {
        let window = match &self.state {
            LeaderState::Leading => self.config.renew_deadline,
            _ => self.config.lease_duration,
        };
        (self.last_observed_change + window - Utc::now()).to_std().unwrap_or(StdDuration::from_secs(0))
    }

    fn set_state(&mut self, state: LeaderState) {
        if state != self.state {
            tracing::info!(?state, "leadership state changed");
        }
        self.state = state;
        let _ = self.state_tx.send(self.state.clone());
        metrics::gauge!(METRIC_IS_LEADER, if self.state == LeaderState::Leading { 1.0 } else { 0.0 });
    }
}

/// Checks that this instance still holds the lease before a mutation is made.
#[derive(Clone)]
pub struct LeaseFence {
    api: Api<Lease>,
    name: String,
    identity: String,
    api_timeout: StdDuration,
}

impl LeaseFence {
    /// Fail unless the lease is currently held by this instance.
    pub async fn check(&self) -> Result<()> {
        let lease = api_result(timeout(self.api_timeout, self.api.get(&self.name)).await, "fetching lease")?;
        if lease_holder(&lease) != self.identity {
            bail!("lease {} is no longer held by {}", self.name, self.identity);
        }
        Ok(())
    }
}

//! Probe dispatcher
//!
//! Runs the probe of one shadow mesh base and reconciles the shadow's content
//! with what the probe describes. The first run writes straight into the fresh
//! shadow. Later runs hold back partners' lock requests, take every lock back
//! and apply only the difference.
//!
//! The dispatcher also decides when to run next: the probe's own wish wins,
//! otherwise the coherence specification in effect, never sooner than the
//! configured minimum delay.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{
    probe::{ProbeDirectory, ProbeError, ProbeObject, ProbeOutput},
    ShadowListener,
};
use crate::{
    config::ShadowConfig,
    endpoint::listeners::ListenerSet,
    error::{MeshError, MeshResult},
    identifier::{CoherenceSpecification, MeshBaseIdentifier, MeshObjectIdentifier},
    meshbase::MeshBase,
    model::{EntityTypeId, PropertyTypeId, RoleTypeId},
    now_millis,
    object::MeshObject,
    transaction::Transaction,
};

struct DispatcherState {
    time_created: i64,
    last_success: Option<i64>,
    last_failure: Option<i64>,
    current_error: Option<String>,
    has_run: bool,
    coherence: CoherenceSpecification,
    probe_preference: Option<Duration>,
    scheduled: Option<Duration>,
    not_needed_since: Option<i64>,
}

pub struct ProbeDispatcher {
    source: MeshBaseIdentifier,
    directory: Arc<ProbeDirectory>,
    min_update_delay: Duration,
    time_not_needed_till_expires_ms: i64,
    state: Mutex<DispatcherState>,
    listeners: ListenerSet<dyn ShadowListener>,
    rescheduled: Notify,
}

impl ProbeDispatcher {
    pub(crate) fn new(source: MeshBaseIdentifier, directory: Arc<ProbeDirectory>, config: &ShadowConfig) -> Self {
        Self {
            source,
            directory,
            min_update_delay: config.min_update_delay(),
            time_not_needed_till_expires_ms: config.time_not_needed_till_expires_ms,
            state: Mutex::new(DispatcherState {
                time_created: now_millis(),
                last_success: None,
                last_failure: None,
                current_error: None,
                has_run: false,
                coherence: config.default_coherence.clone(),
                probe_preference: None,
                scheduled: None,
                not_needed_since: None,
            }),
            listeners: ListenerSet::new(),
            rescheduled: Notify::new(),
        }
    }

    pub fn source(&self) -> &MeshBaseIdentifier {
        &self.source
    }

    pub fn time_created(&self) -> i64 {
        self.state.lock().time_created
    }

    pub fn last_successful_update(&self) -> Option<i64> {
        self.state.lock().last_success
    }

    pub fn last_unsuccessful_update(&self) -> Option<i64> {
        self.state.lock().last_failure
    }

    /// Error of the most recent run, cleared when a run starts
    pub fn current_error(&self) -> Option<String> {
        self.state.lock().current_error.clone()
    }

    pub fn has_run(&self) -> bool {
        self.state.lock().has_run
    }

    pub fn coherence(&self) -> CoherenceSpecification {
        self.state.lock().coherence.clone()
    }

    /// Delay until the next run, `None` if no run is planned
    pub fn scheduled_delay(&self) -> Option<Duration> {
        self.state.lock().scheduled
    }

    pub(crate) fn listeners(&self) -> &ListenerSet<dyn ShadowListener> {
        &self.listeners
    }

    /// Resolves when the schedule changed for a reason other than a finished run
    pub(crate) async fn rescheduled(&self) {
        self.rescheduled.notified().await
    }

    /// Switches to `coherence` and plans the next run from scratch
    pub fn set_coherence(&self, coherence: CoherenceSpecification) {
        {
            let mut state = self.state.lock();
            if state.coherence == coherence {
                return;
            }
            debug!(source = %self.source, coherence = coherence.as_str(), "Coherence changed");
            state.scheduled = coherence
                .next_delay(None, true)
                .map(|delay| delay.max(self.min_update_delay));
            state.coherence = coherence;
        }
        self.rescheduled.notify_one();
    }

    /// Plans the next run after a run that did or did not change anything
    pub fn schedule_next(&self, changed: bool) -> Option<Duration> {
        let mut state = self.state.lock();
        let from_coherence = state.coherence.next_delay(state.scheduled, changed);
        let next = state
            .probe_preference
            .or(from_coherence)
            .map(|delay| delay.max(self.min_update_delay));
        state.scheduled = next;
        next
    }

    /// True while some object of the shadow is replicated to another mesh base
    pub fn is_needed(&self, base: &MeshBase) -> bool {
        base.has_replicas()
    }

    /// True once the shadow has not been needed for the configured grace period
    pub fn may_be_deleted(&self, base: &MeshBase) -> bool {
        let needed = self.is_needed(base);
        let mut state = self.state.lock();
        if needed {
            state.not_needed_since = None;
            return false;
        }
        let now = now_millis();
        let since = *state.not_needed_since.get_or_insert(now);
        self.time_not_needed_till_expires_ms >= 0 && now - since >= self.time_not_needed_till_expires_ms
    }

    /// Runs the probe and brings the shadow in line with its output; true if anything changed
    pub async fn do_update_now(&self, base: &Arc<MeshBase>) -> MeshResult<bool> {
        let first_run = {
            let mut state = self.state.lock();
            state.current_error = None;
            !state.has_run
        };
        if !first_run {
            self.listeners
                .fire("update_started", |l| l.update_started(&self.source));
        }

        let output = match self.directory.run(&self.source).await {
            Ok(output) => output,
            Err(error) => {
                warn!(source = %self.source, error = %error, "Probe run failed");
                self.record_failure(error.to_string());
                if !first_run {
                    self.listeners.fire("update_finished_unsuccessfully", |l| {
                        l.update_finished_unsuccessfully(&self.source, &error)
                    });
                }
                return Err(error.into());
            }
        };

        let applied = if first_run {
            self.write_first_run(base, &output).await
        } else {
            self.apply_difference(base, &output).await
        };
        match applied {
            Ok(changed) => {
                {
                    let mut state = self.state.lock();
                    state.has_run = true;
                    state.last_success = Some(now_millis());
                    state.probe_preference = output.next_run;
                }
                info!(source = %self.source, first_run, changed, objects = output.objects.len(), "Probe run finished");
                if !first_run {
                    if changed {
                        self.listeners.fire("update_finished_successfully", |l| {
                            l.update_finished_successfully(&self.source)
                        });
                    } else {
                        self.listeners
                            .fire("update_skipped", |l| l.update_skipped(&self.source));
                    }
                }
                Ok(changed)
            }
            Err(error) => {
                warn!(source = %self.source, error = %error, "Applying probe output failed");
                self.record_failure(error.to_string());
                if !first_run {
                    let failure = ProbeError::Failed {
                        data_source: self.source.to_string(),
                        reason: error.to_string(),
                    };
                    self.listeners.fire("update_finished_unsuccessfully", |l| {
                        l.update_finished_unsuccessfully(&self.source, &failure)
                    });
                }
                Err(error)
            }
        }
    }

    fn record_failure(&self, error: String) {
        let mut state = self.state.lock();
        state.current_error = Some(error);
        state.last_failure = Some(now_millis());
    }

    async fn write_first_run(&self, base: &Arc<MeshBase>, output: &ProbeOutput) -> MeshResult<bool> {
        let tx = base.create_transaction().await?;
        self.reconcile(base, &tx, output).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn apply_difference(&self, base: &Arc<MeshBase>, output: &ProbeOutput) -> MeshResult<bool> {
        let mut affected: Vec<MeshObjectIdentifier> =
            base.objects().iter().map(|o| o.identifier().clone()).collect();
        affected.extend(output.objects.iter().map(|o| o.identifier_in(&self.source)));
        let _update = base.begin_update(&affected);

        for object in base.objects() {
            object.force_obtain_lock().await?;
        }
        let tx = base.create_transaction().await?;
        self.reconcile(base, &tx, output).await?;
        let changed = tx.pending_changes() > 0;
        tx.commit().await?;
        Ok(changed)
    }

    /// Makes the shadow's content equal to `output`
    async fn reconcile(&self, base: &Arc<MeshBase>, tx: &Transaction, output: &ProbeOutput) -> MeshResult<()> {
        let wanted: BTreeMap<MeshObjectIdentifier, &ProbeObject> = output
            .objects
            .iter()
            .map(|object| (object.identifier_in(&self.source), object))
            .collect();

        let doomed: Vec<Arc<MeshObject>> = base
            .objects()
            .into_iter()
            .filter(|o| !o.is_home_object() && !wanted.contains_key(o.identifier()))
            .collect();
        if !doomed.is_empty() {
            base.lifecycle().delete_mesh_objects(tx, &doomed).await?;
        }

        for (identifier, description) in &wanted {
            let object = match base.find_mesh_object(identifier) {
                Some(object) => object,
                None => {
                    base.lifecycle()
                        .create_mesh_object(tx, Some(identifier.clone()), &[])
                        .await?
                }
            };
            reconcile_content(tx, &object, description).await?;
        }

        self.reconcile_relationships(base, tx, &wanted).await
    }

    async fn reconcile_relationships(
        &self,
        base: &Arc<MeshBase>,
        tx: &Transaction,
        wanted: &BTreeMap<MeshObjectIdentifier, &ProbeObject>,
    ) -> MeshResult<()> {
        let mut wanted_pairs = BTreeSet::new();
        let mut wanted_roles: BTreeMap<(MeshObjectIdentifier, MeshObjectIdentifier), BTreeSet<RoleTypeId>> =
            BTreeMap::new();
        for (identifier, description) in wanted {
            for relationship in &description.relationships {
                let neighbor = MeshObjectIdentifier::new(self.source.clone(), relationship.neighbor.clone());
                if &neighbor == identifier || !wanted.contains_key(&neighbor) {
                    warn!(object = %identifier, %neighbor, "Ignoring relationship to an undescribed object");
                    continue;
                }
                wanted_pairs.insert(ordered(identifier, &neighbor));
                wanted_roles
                    .entry((identifier.clone(), neighbor))
                    .or_default()
                    .extend(relationship.roles.iter().cloned());
            }
        }

        let mut existing_pairs = BTreeSet::new();
        for object in base.objects() {
            for neighbor in object.neighbors() {
                if neighbor.base() == &self.source {
                    existing_pairs.insert(ordered(object.identifier(), &neighbor));
                }
            }
        }

        for (a, b) in existing_pairs.difference(&wanted_pairs) {
            if let Some(object) = base.find_mesh_object(a) {
                object.unrelate(tx, b).await?;
            }
        }
        for (a, b) in wanted_pairs.difference(&existing_pairs) {
            let (Some(object), Some(neighbor)) = (base.find_mesh_object(a), base.find_mesh_object(b)) else {
                continue;
            };
            object.relate(tx, &neighbor).await?;
        }

        for (a, b) in &wanted_pairs {
            for (from, to) in [(a, b), (b, a)] {
                let Some(object) = base.find_mesh_object(from) else {
                    continue;
                };
                let current = object.roles_with(to).unwrap_or_default();
                let roles = wanted_roles
                    .get(&(from.clone(), to.clone()))
                    .cloned()
                    .unwrap_or_default();
                let added: Vec<RoleTypeId> = roles.difference(&current).cloned().collect();
                let removed: Vec<RoleTypeId> = current.difference(&roles).cloned().collect();
                if !added.is_empty() {
                    object.bless_role(tx, to, &added).await?;
                }
                if !removed.is_empty() {
                    object.unbless_role(tx, to, &removed).await?;
                }
            }
        }
        Ok(())
    }
}

fn ordered(
    a: &MeshObjectIdentifier,
    b: &MeshObjectIdentifier,
) -> (MeshObjectIdentifier, MeshObjectIdentifier) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Types and properties of one object
async fn reconcile_content(tx: &Transaction, object: &Arc<MeshObject>, description: &ProbeObject) -> MeshResult<()> {
    let current: BTreeSet<EntityTypeId> = object.types().into_iter().collect();
    let wanted: BTreeSet<EntityTypeId> = description.types.iter().cloned().collect();

    let added: Vec<EntityTypeId> = wanted.difference(&current).cloned().collect();
    if !added.is_empty() {
        object.bless(tx, &added).await?;
    }

    let properties = object.properties();
    for (property, value) in &description.properties {
        if properties.get(property) != Some(value) {
            object.set_property(tx, property, Some(value.clone())).await?;
        }
    }
    let dropped: Vec<&PropertyTypeId> = properties
        .keys()
        .filter(|property| !description.properties.contains_key(*property))
        .collect();
    for property in dropped {
        object.set_property(tx, property, None).await?;
    }

    let removed: Vec<EntityTypeId> = current.difference(&wanted).cloned().collect();
    if !removed.is_empty() {
        match object.unbless(tx, &removed).await {
            Ok(()) | Err(MeshError::NotBlessed { .. }) => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(config: ShadowConfig) -> ProbeDispatcher {
        ProbeDispatcher::new("shadow".into(), Arc::new(ProbeDirectory::new()), &config)
    }

    #[test]
    fn test_probe_preference_wins_over_coherence() {
        let mut config = ShadowConfig::default();
        config.default_coherence = CoherenceSpecification::Periodic { period_ms: 60_000 };
        config.min_update_delay_ms = 100;
        let dispatcher = dispatcher(config);

        assert_eq!(dispatcher.schedule_next(true), Some(Duration::from_secs(60)));
        dispatcher.state.lock().probe_preference = Some(Duration::from_millis(10));
        assert_eq!(dispatcher.schedule_next(true), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_adaptive_delay_grows_while_unchanged() {
        let mut config = ShadowConfig::default();
        config.default_coherence = CoherenceSpecification::AdaptivePeriodic {
            fallback_delay_ms: 1000,
            max_delay_ms: 3000,
            adaptive_factor: 2.0,
        };
        let dispatcher = dispatcher(config);

        assert_eq!(dispatcher.schedule_next(true), Some(Duration::from_secs(1)));
        assert_eq!(dispatcher.schedule_next(false), Some(Duration::from_secs(2)));
        assert_eq!(dispatcher.schedule_next(false), Some(Duration::from_secs(3)));
        assert_eq!(dispatcher.schedule_next(true), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_one_time_coherence_plans_nothing() {
        let dispatcher = dispatcher(ShadowConfig::default());
        assert_eq!(dispatcher.schedule_next(true), None);

        dispatcher.set_coherence(CoherenceSpecification::Periodic { period_ms: 5000 });
        assert_eq!(dispatcher.scheduled_delay(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_ordered_pair() {
        let a = MeshObjectIdentifier::new("s".into(), "a");
        let b = MeshObjectIdentifier::new("s".into(), "b");
        assert_eq!(ordered(&a, &b), ordered(&b, &a));
    }
}

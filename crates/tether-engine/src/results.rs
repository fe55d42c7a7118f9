//! Producer-side consumption and interpolation of pull snapshots.
//!
//! [`ResultsManager`] keeps a "previous" and a "next" pull snapshot and
//! presents, for a query time, a per-object blend between the two. Three
//! regimes are handled:
//!
//! - **sync**: the whole pull queue collapses to the latest snapshot,
//!   which is presented as-is (factor 1, no previous);
//! - **async**: snapshots are consumed until "next" covers the query time
//!   and each object is blended with the factor
//!   `clamp((query - next.start) / (next.end - next.start), 0, 1)`;
//! - **resim**: a snapshot whose interval ends no later than the latest
//!   end time already seen is a replay. Objects whose replayed state does
//!   not match the original are leashed toward the correction by the
//!   [`DivergenceTracker`].
//!
//! Results for stale proxies, rigid, constraint and aggregate alike, are
//! dropped; the producer sees "no such object", never a dangling state.

use std::collections::VecDeque;

use indexmap::IndexMap;
use tether_arena::ProxyArena;
use tether_core::{
    AggregateResult, ConstraintResult, ProxyHandle, PullSnapshot, RigidState, SimTimestamp,
};

use crate::config::InterpolationConfig;
use crate::divergence::DivergenceTracker;
use crate::marshal::MarshallingManager;
use crate::metrics::PipelineMetrics;

#[derive(Clone, Copy, Debug)]
struct InterpEntry {
    prev: RigidState,
    next: RigidState,
    output: RigidState,
}

/// Interpolates pull snapshots for the producer.
#[derive(Debug)]
pub struct ResultsManager {
    config: InterpolationConfig,
    prev: Option<Box<PullSnapshot>>,
    next: Option<Box<PullSnapshot>>,
    /// Superseded snapshots, newest first. Searched for the original of a
    /// replayed step.
    history: VecDeque<Box<PullSnapshot>>,
    latest_end_time: Option<f64>,
    last_sim_timestamp: Option<SimTimestamp>,
    entries: IndexMap<ProxyHandle, InterpEntry>,
    divergence: DivergenceTracker,
    alpha: f32,
    query_time: f64,
    pulls_collapsed: u64,
    stale_results_dropped: u64,
    resim_results: u64,
}

impl ResultsManager {
    /// Create a manager with the given interpolation settings.
    pub fn new(config: InterpolationConfig) -> Self {
        Self {
            divergence: DivergenceTracker::new(config.resim_time_constant, config.resim_strength),
            history: VecDeque::with_capacity(config.result_history),
            config,
            prev: None,
            next: None,
            latest_end_time: None,
            last_sim_timestamp: None,
            entries: IndexMap::new(),
            alpha: 1.0,
            query_time: 0.0,
            pulls_collapsed: 0,
            stale_results_dropped: 0,
            resim_results: 0,
        }
    }

    // ── Sync ──────────────────────────────────────────────────────

    /// Consume every pending pull snapshot and present the latest as-is.
    pub fn pull_sync<'a>(
        &'a mut self,
        marshal: &mut MarshallingManager,
        proxies: &'a mut ProxyArena,
    ) -> PullResult<'a> {
        // Blends in progress land on their target.
        for (handle, entry) in &self.entries {
            proxies.update(*handle, entry.next);
        }
        self.entries.clear();
        self.divergence.clear();
        if let Some(prev) = self.prev.take() {
            self.retire(prev, marshal);
        }

        let mut latest: Option<Box<PullSnapshot>> = None;
        let mut collapsed = 0u64;
        while let Some(mut snap) = marshal.pop_pull_snapshot() {
            self.check_order(&snap);
            for handle in &snap.despawned {
                self.divergence.forget(*handle);
            }
            self.drop_stale_details(&mut snap, proxies);
            for (handle, state) in &snap.rigids {
                if !proxies.update(*handle, *state) {
                    self.stale_results_dropped += 1;
                }
            }
            self.note_end_time(snap.external_end_time);
            if let Some(older) = latest.replace(snap) {
                collapsed += 1;
                self.retire(older, marshal);
            }
        }
        if collapsed > 0 {
            tracing::debug!(collapsed, "sync pull collapsed queue");
        }
        if let Some(latest) = latest {
            if let Some(next) = self.next.replace(latest) {
                self.retire(next, marshal);
            }
        }
        if let Some(next) = self.next.as_deref() {
            for (handle, state) in &next.rigids {
                proxies.update(*handle, *state);
            }
        }
        self.pulls_collapsed += collapsed;
        self.alpha = 1.0;
        self.query_time = self.latest_end_time.unwrap_or(0.0);
        self.view(proxies)
    }

    // ── Async ─────────────────────────────────────────────────────

    /// Consume pull snapshots until one covers `query_time` and present
    /// the interpolated state at that time.
    ///
    /// A non-positive `query_time` means not enough delay has been
    /// buffered yet and is served as a sync pull. With no results at all
    /// the factor is 1 and every object keeps its last known state.
    pub fn pull_async<'a>(
        &'a mut self,
        marshal: &mut MarshallingManager,
        proxies: &'a mut ProxyArena,
        query_time: f64,
    ) -> PullResult<'a> {
        if !(query_time > 0.0) {
            return self.pull_sync(marshal, proxies);
        }
        self.query_time = query_time;

        loop {
            if self
                .next
                .as_ref()
                .is_some_and(|next| next.external_end_time >= query_time)
            {
                break;
            }
            let Some(snap) = marshal.pop_pull_snapshot() else {
                break;
            };
            self.consume(snap, marshal, proxies, query_time);
        }

        self.alpha = match &self.next {
            Some(next) => interpolation_factor(next, query_time),
            None => 1.0,
        };
        self.render(proxies, query_time);
        self.view(proxies)
    }

    fn consume(
        &mut self,
        mut snap: Box<PullSnapshot>,
        marshal: &MarshallingManager,
        proxies: &mut ProxyArena,
        query_time: f64,
    ) {
        self.check_order(&snap);
        for handle in &snap.despawned {
            self.entries.shift_remove(handle);
            self.divergence.forget(*handle);
        }
        self.drop_stale_details(&mut snap, proxies);

        let is_resim = self
            .latest_end_time
            .is_some_and(|latest| snap.external_end_time <= latest);
        if is_resim {
            self.consume_resim(&snap, proxies, query_time);
            if let Some(prev) = self.prev.take() {
                self.retire(prev, marshal);
            }
            if let Some(next) = self.next.take() {
                self.retire(next, marshal);
            }
        } else {
            if let Some(prev) = self.prev.take() {
                self.retire(prev, marshal);
            }
            self.prev = self.next.take();
            self.consume_fresh(&snap, proxies);
        }
        self.note_end_time(snap.external_end_time);
        self.next = Some(snap);
    }

    /// Advance every entry by one interval and start the objects dirtied
    /// by `snap` toward their new state.
    fn consume_fresh(&mut self, snap: &PullSnapshot, proxies: &mut ProxyArena) {
        for entry in self.entries.values_mut() {
            entry.prev = entry.next;
        }
        for (handle, state) in &snap.rigids {
            if !proxies.contains(*handle) {
                self.stale_results_dropped += 1;
                continue;
            }
            match self.entries.get_mut(handle) {
                Some(entry) => entry.next = *state,
                None => {
                    let seed = self
                        .prev
                        .as_ref()
                        .and_then(|prev| prev.rigid(*handle))
                        .or_else(|| proxies.get(*handle))
                        .copied()
                        .unwrap_or(*state);
                    self.entries.insert(
                        *handle,
                        InterpEntry {
                            prev: seed,
                            next: *state,
                            output: seed,
                        },
                    );
                }
            }
        }
        // Settled entries carry no motion: park their final pose in the arena.
        let prev = self.prev.as_deref();
        let divergence = &self.divergence;
        self.entries.retain(|handle, entry| {
            let moving = snap.rigids.contains_key(handle)
                || prev.is_some_and(|p| p.rigids.contains_key(handle))
                || divergence.contains(*handle);
            if !moving {
                proxies.update(*handle, entry.next);
            }
            moving
        });
    }

    /// Compare a replayed snapshot with what was originally delivered for
    /// the same step and restart interpolation from the presented pose.
    fn consume_resim(&mut self, snap: &PullSnapshot, proxies: &ProxyArena, query_time: f64) {
        self.resim_results += 1;
        tracing::debug!(
            step = snap.internal_step.0,
            sim_ts = snap.sim_timestamp.0,
            end = snap.external_end_time,
            "resimulated result"
        );
        let original = find_original(
            snap,
            self.next.as_deref(),
            self.prev.as_deref(),
            &self.history,
        );
        if original.is_none() {
            tracing::debug!(step = snap.internal_step.0, "original result no longer retained");
        }
        let original = original.map(|o| &o.rigids);

        for (handle, state) in &snap.rigids {
            if !proxies.contains(*handle) {
                self.stale_results_dropped += 1;
                continue;
            }
            let rendered = self
                .entries
                .get(handle)
                .map(|e| e.output)
                .or_else(|| proxies.get(*handle).copied())
                .unwrap_or(*state);
            // Nothing to compare against: restart the blend without a leash.
            if let Some(original) = original {
                self.divergence
                    .observe(*handle, original.get(handle), state, query_time, rendered);
            }
            let entry = self.entries.entry(*handle).or_insert(InterpEntry {
                prev: rendered,
                next: *state,
                output: rendered,
            });
            entry.prev = entry.output;
            entry.next = *state;
        }
    }

    fn render(&mut self, proxies: &mut ProxyArena, query_time: f64) {
        let alpha = self.alpha;
        for (handle, entry) in &mut self.entries {
            let base = entry.prev.interpolate(&entry.next, alpha);
            entry.output = self.divergence.apply(*handle, base, query_time);
            proxies.update(*handle, entry.output);
        }
    }

    // ── Bookkeeping ───────────────────────────────────────────────

    fn check_order(&mut self, snap: &PullSnapshot) {
        if let Some(last) = self.last_sim_timestamp {
            assert!(
                snap.sim_timestamp > last,
                "pull snapshot sim timestamp {} not after {}",
                snap.sim_timestamp,
                last
            );
        }
        self.last_sim_timestamp = Some(snap.sim_timestamp);
    }

    /// Drop constraint and aggregate results whose proxy is gone.
    fn drop_stale_details(&mut self, snap: &mut PullSnapshot, proxies: &ProxyArena) {
        let before = snap.constraints.len() + snap.aggregates.len();
        snap.constraints.retain(|c| proxies.contains(c.handle));
        snap.aggregates.retain(|a| proxies.contains(a.handle));
        let dropped = before - snap.constraints.len() - snap.aggregates.len();
        self.stale_results_dropped += dropped as u64;
    }

    fn note_end_time(&mut self, end: f64) {
        self.latest_end_time = Some(self.latest_end_time.map_or(end, |t| t.max(end)));
    }

    /// Move a superseded snapshot into history, freeing the oldest.
    fn retire(&mut self, snap: Box<PullSnapshot>, marshal: &MarshallingManager) {
        if self.config.result_history == 0 {
            marshal.free_pull_snapshot(snap);
            return;
        }
        self.history.push_front(snap);
        while self.history.len() > self.config.result_history {
            if let Some(old) = self.history.pop_back() {
                marshal.free_pull_snapshot(old);
            }
        }
    }

    /// Return every held snapshot to the pool and forget all state.
    pub fn clear(&mut self, marshal: &MarshallingManager) {
        for snap in self
            .prev
            .take()
            .into_iter()
            .chain(self.next.take())
            .chain(self.history.drain(..))
        {
            marshal.free_pull_snapshot(snap);
        }
        self.entries.clear();
        self.divergence.clear();
        self.latest_end_time = None;
        self.last_sim_timestamp = None;
        self.alpha = 1.0;
        self.query_time = 0.0;
    }

    fn view<'a>(&'a self, proxies: &'a ProxyArena) -> PullResult<'a> {
        PullResult {
            alpha: self.alpha,
            query_time: self.query_time,
            prev: self.prev.as_deref(),
            next: self.next.as_deref(),
            proxies,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────

    /// Leash progress for a diverged object; `None` if not diverged.
    pub fn leash_factor(&self, handle: ProxyHandle, query_time: f64) -> Option<f64> {
        self.divergence.leash_factor(handle, query_time)
    }

    /// Whether `handle` is currently being leashed.
    pub fn is_diverged(&self, handle: ProxyHandle) -> bool {
        self.divergence.contains(handle)
    }

    /// Factor of the most recent pull.
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Latest interval end time consumed so far.
    pub fn latest_end_time(&self) -> Option<f64> {
        self.latest_end_time
    }

    /// Snapshots currently held (previous, next and history).
    pub fn held_snapshots(&self) -> usize {
        self.prev.is_some() as usize + self.next.is_some() as usize + self.history.len()
    }

    /// Copy the producer-side counters into `out`.
    pub fn fill(&self, out: &mut PipelineMetrics) {
        out.pulls_collapsed = self.pulls_collapsed;
        out.stale_results_dropped = self.stale_results_dropped;
        out.resim_results = self.resim_results;
        out.divergences_detected = self.divergence.detected();
        out.divergences_retired = self.divergence.retired();
    }
}

/// `clamp((query - start) / (end - start), 0, 1)`; 1 for an empty interval.
fn interpolation_factor(next: &PullSnapshot, query_time: f64) -> f32 {
    let span = next.external_end_time - next.external_start_time;
    if span <= 0.0 {
        return 1.0;
    }
    ((query_time - next.external_start_time) / span).clamp(0.0, 1.0) as f32
}

/// The most recently delivered result for the same step as `replay`.
fn find_original<'a>(
    replay: &PullSnapshot,
    next: Option<&'a PullSnapshot>,
    prev: Option<&'a PullSnapshot>,
    history: &'a VecDeque<Box<PullSnapshot>>,
) -> Option<&'a PullSnapshot> {
    next.into_iter()
        .chain(prev)
        .chain(history.iter().map(|s| &**s))
        .find(|s| s.internal_step == replay.internal_step)
}

// ── PullResult ────────────────────────────────────────────────────

/// The producer's view after a pull.
#[derive(Clone, Copy, Debug)]
pub struct PullResult<'a> {
    alpha: f32,
    query_time: f64,
    prev: Option<&'a PullSnapshot>,
    next: Option<&'a PullSnapshot>,
    proxies: &'a ProxyArena,
}

impl<'a> PullResult<'a> {
    /// Interpolation factor between previous and next, in `[0, 1]`.
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Producer time the result was computed for.
    pub fn query_time(&self) -> f64 {
        self.query_time
    }

    /// Earlier snapshot of the pair; absent in sync and post-resim pulls.
    pub fn prev(&self) -> Option<&'a PullSnapshot> {
        self.prev
    }

    /// Later snapshot of the pair.
    pub fn next(&self) -> Option<&'a PullSnapshot> {
        self.next
    }

    /// Presented state of `handle`; `None` once the proxy is gone.
    pub fn state(&self, handle: ProxyHandle) -> Option<&'a RigidState> {
        self.proxies.get(handle)
    }

    /// Constraint results of the latest snapshot whose proxy is still live.
    pub fn constraints(&self) -> impl Iterator<Item = &'a ConstraintResult> + 'a {
        let proxies = self.proxies;
        self.next
            .into_iter()
            .flat_map(|next| next.constraints.iter())
            .filter(move |c| proxies.contains(c.handle))
    }

    /// Aggregate results of the latest snapshot whose proxy is still live.
    pub fn aggregates(&self) -> impl Iterator<Item = &'a AggregateResult> + 'a {
        let proxies = self.proxies;
        self.next
            .into_iter()
            .flat_map(|next| next.aggregates.iter())
            .filter(move |a| proxies.contains(a.handle))
    }

    /// Latest pieces of aggregate `handle`; `None` once the proxy is gone.
    pub fn aggregate(&self, handle: ProxyHandle) -> Option<&'a AggregateResult> {
        self.aggregates().find(|a| a.handle == handle)
    }

    /// Every live proxy with its presented state.
    pub fn iter(&self) -> impl Iterator<Item = (ProxyHandle, &'a RigidState)> + 'a {
        self.proxies.iter()
    }

    /// Whether no result has been received yet.
    pub fn is_empty(&self) -> bool {
        self.next.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{link, SimLink};
    use tether_core::{ExternalTimestamp, InternalStep, Vec3};

    struct Feed {
        sim: SimLink,
        sim_ts: u64,
    }

    impl Feed {
        fn new(sim: SimLink) -> Self {
            Self { sim, sim_ts: 0 }
        }

        fn publish(&mut self, step: u64, start: f64, end: f64, rigids: &[(ProxyHandle, f32)]) {
            self.publish_with(step, start, end, |pull| {
                for (h, x) in rigids {
                    pull.push_rigid(*h, at(*x));
                }
            });
        }

        fn publish_with(
            &mut self,
            step: u64,
            start: f64,
            end: f64,
            fill: impl FnOnce(&mut PullSnapshot),
        ) {
            let mut pull = self.sim.alloc_pull_snapshot();
            pull.sim_timestamp = SimTimestamp(self.sim_ts);
            pull.internal_step = InternalStep(step);
            pull.external_timestamp = ExternalTimestamp(step);
            pull.external_start_time = start;
            pull.external_end_time = end;
            fill(&mut pull);
            self.sim_ts += 1;
            self.sim.publish(pull);
        }
    }

    fn at(x: f32) -> RigidState {
        RigidState::dynamic_at(Vec3::new(x, 0.0, 0.0))
    }

    fn config() -> InterpolationConfig {
        InterpolationConfig::default()
    }

    fn x_of(result: &PullResult<'_>, h: ProxyHandle) -> f32 {
        result.state(h).unwrap().position.x
    }

    #[test]
    fn starved_async_pull_keeps_last_known() {
        let (mut mm, _sim) = link(0);
        let mut proxies = ProxyArena::new();
        let h = proxies.spawn(at(3.0));
        let mut rm = ResultsManager::new(config());
        let r = rm.pull_async(&mut mm, &mut proxies, 1.0);
        assert_eq!(r.alpha(), 1.0);
        assert!(r.is_empty());
        assert!(r.prev().is_none());
        assert_eq!(x_of(&r, h), 3.0);
    }

    #[test]
    fn sync_pull_collapses_to_latest() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let h = proxies.spawn(at(0.0));
        for i in 0..4 {
            feed.publish(i, i as f64, i as f64 + 1.0, &[(h, i as f32 + 1.0)]);
        }
        let mut rm = ResultsManager::new(config());
        let r = rm.pull_sync(&mut mm, &mut proxies);
        assert_eq!(r.alpha(), 1.0);
        assert!(r.prev().is_none());
        assert_eq!(r.next().unwrap().internal_step, InternalStep(3));
        assert_eq!(x_of(&r, h), 4.0);
        let mut m = PipelineMetrics::default();
        rm.fill(&mut m);
        assert_eq!(m.pulls_collapsed, 3);
    }

    #[test]
    fn sync_pull_after_async_presents_latest_result() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let h = proxies.spawn(at(0.0));
        feed.publish(0, 0.0, 1.0, &[(h, 10.0)]);
        feed.publish(1, 1.0, 2.0, &[(h, 20.0)]);
        let mut rm = ResultsManager::new(config());
        let r = rm.pull_async(&mut mm, &mut proxies, 1.5);
        assert!((x_of(&r, h) - 15.0).abs() < 1e-4);

        // Nothing new queued: the held latest result is presented.
        let r = rm.pull_sync(&mut mm, &mut proxies);
        assert_eq!(r.alpha(), 1.0);
        assert!(r.prev().is_none());
        assert_eq!(x_of(&r, h), 20.0);
        assert_eq!(x_of(&r, h), r.next().unwrap().rigid(h).unwrap().position.x);
    }

    #[test]
    fn non_positive_query_is_served_sync() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let h = proxies.spawn(at(0.0));
        feed.publish(0, 0.0, 1.0, &[(h, 1.0)]);
        feed.publish(1, 1.0, 2.0, &[(h, 2.0)]);
        let mut rm = ResultsManager::new(config());
        let r = rm.pull_async(&mut mm, &mut proxies, -0.5);
        assert_eq!(r.alpha(), 1.0);
        assert!(r.prev().is_none());
        assert_eq!(x_of(&r, h), 2.0);
    }

    #[test]
    fn async_pull_blends_between_consecutive_results() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let h = proxies.spawn(at(0.0));
        feed.publish(0, 0.0, 1.0, &[(h, 10.0)]);
        feed.publish(1, 1.0, 2.0, &[(h, 20.0)]);
        feed.publish(2, 2.0, 3.0, &[(h, 30.0)]);

        let mut rm = ResultsManager::new(config());
        let r = rm.pull_async(&mut mm, &mut proxies, 1.25);
        assert_eq!(r.prev().unwrap().internal_step, InternalStep(0));
        assert_eq!(r.next().unwrap().internal_step, InternalStep(1));
        assert!((r.alpha() - 0.25).abs() < 1e-6);
        assert!((x_of(&r, h) - 12.5).abs() < 1e-4);

        // Still covered by the cached next: factor only.
        let r = rm.pull_async(&mut mm, &mut proxies, 1.75);
        assert_eq!(r.next().unwrap().internal_step, InternalStep(1));
        assert!((x_of(&r, h) - 17.5).abs() < 1e-4);
        assert_eq!(mm.pending_pulls(), 1);

        let r = rm.pull_async(&mut mm, &mut proxies, 2.5);
        assert_eq!(r.prev().unwrap().internal_step, InternalStep(1));
        assert!((x_of(&r, h) - 25.0).abs() < 1e-4);
    }

    #[test]
    fn new_object_seeds_from_last_known_state() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let h = proxies.spawn(at(4.0));
        feed.publish(0, 0.0, 1.0, &[(h, 8.0)]);
        let mut rm = ResultsManager::new(config());
        let r = rm.pull_async(&mut mm, &mut proxies, 0.5);
        assert!((x_of(&r, h) - 6.0).abs() < 1e-5);
    }

    #[test]
    fn untouched_object_settles_on_next_interval() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let a = proxies.spawn(at(0.0));
        let b = proxies.spawn(at(0.0));
        feed.publish(0, 0.0, 1.0, &[(a, 1.0), (b, 1.0)]);
        feed.publish(1, 1.0, 2.0, &[(a, 2.0)]);
        let mut rm = ResultsManager::new(config());
        rm.pull_async(&mut mm, &mut proxies, 0.9);
        let r = rm.pull_async(&mut mm, &mut proxies, 1.5);
        assert!((x_of(&r, a) - 1.5).abs() < 1e-5);
        assert_eq!(x_of(&r, b), 1.0);
    }

    #[test]
    fn stale_proxy_results_are_dropped() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let h = proxies.spawn(at(0.0));
        feed.publish(0, 0.0, 1.0, &[(h, 5.0)]);
        proxies.despawn(h).unwrap();
        let reused = proxies.spawn(at(-1.0));
        assert_eq!(reused.index(), h.index());

        let mut rm = ResultsManager::new(config());
        let r = rm.pull_async(&mut mm, &mut proxies, 0.5);
        assert!(r.state(h).is_none());
        assert_eq!(x_of(&r, reused), -1.0);
        let mut m = PipelineMetrics::default();
        rm.fill(&mut m);
        assert_eq!(m.stale_results_dropped, 1);
    }

    #[test]
    fn replayed_divergent_result_is_leashed() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let h = proxies.spawn(at(0.0));
        let mut rm = ResultsManager::new(InterpolationConfig {
            resim_time_constant: 1.0,
            resim_strength: 0.5,
            ..config()
        });

        feed.publish(0, 0.0, 1.0, &[(h, 1.0)]);
        feed.publish(1, 1.0, 2.0, &[(h, 2.0)]);
        let r = rm.pull_async(&mut mm, &mut proxies, 2.0);
        assert_eq!(x_of(&r, h), 2.0);

        // Replay of step 1 lands somewhere else.
        feed.publish(1, 1.0, 2.0, &[(h, 6.0)]);
        feed.publish(2, 2.0, 3.0, &[(h, 7.0)]);
        let r = rm.pull_async(&mut mm, &mut proxies, 2.5);
        assert_eq!(r.next().unwrap().internal_step, InternalStep(2));
        let x = x_of(&r, h);
        assert!(x > 2.0 && x < 6.5, "leashed, not snapped: {x}");
        assert!(rm.is_diverged(h));
        assert_eq!(rm.leash_factor(h, 2.5), Some(0.0));
        assert_eq!(rm.leash_factor(h, 3.0), Some(0.5));

        // Leash runs out one time constant after detection.
        feed.publish(3, 3.0, 4.0, &[(h, 8.0)]);
        let r = rm.pull_async(&mut mm, &mut proxies, 3.5);
        assert!((x_of(&r, h) - 7.5).abs() < 1e-5);
        assert!(!rm.is_diverged(h));

        let mut m = PipelineMetrics::default();
        rm.fill(&mut m);
        assert_eq!(m.resim_results, 1);
        assert_eq!(m.divergences_detected, 1);
        assert_eq!(m.divergences_retired, 1);
    }

    #[test]
    fn replay_matching_original_is_not_divergence() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let h = proxies.spawn(at(0.0));
        let mut rm = ResultsManager::new(config());
        feed.publish(0, 0.0, 1.0, &[(h, 1.0)]);
        rm.pull_async(&mut mm, &mut proxies, 1.0);
        feed.publish(0, 0.0, 1.0, &[(h, 1.0)]);
        let r = rm.pull_async(&mut mm, &mut proxies, 1.5);
        assert!(r.prev().is_none());
        assert!(!rm.is_diverged(h));
        assert_eq!(rm.resim_results, 1);
    }

    #[test]
    fn replay_of_evicted_step_starts_no_leash() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let h = proxies.spawn(at(0.0));
        let mut rm = ResultsManager::new(InterpolationConfig {
            result_history: 0,
            ..config()
        });
        for i in 0..4u64 {
            feed.publish(i, i as f64, i as f64 + 1.0, &[(h, i as f32 + 1.0)]);
        }
        rm.pull_async(&mut mm, &mut proxies, 3.5);
        assert_eq!(rm.held_snapshots(), 2);

        // Step 0 replays bit-identically, but its original was already freed.
        feed.publish(0, 0.0, 1.0, &[(h, 1.0)]);
        feed.publish(4, 4.0, 5.0, &[(h, 5.0)]);
        rm.pull_async(&mut mm, &mut proxies, 4.5);
        assert!(!rm.is_diverged(h));
        assert_eq!(rm.leash_factor(h, 4.5), None);

        let mut m = PipelineMetrics::default();
        rm.fill(&mut m);
        assert_eq!(m.resim_results, 1);
        assert_eq!(m.divergences_detected, 0);
    }

    #[test]
    fn stale_constraint_and_aggregate_results_are_dropped() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let live = proxies.spawn(at(0.0));
        let gone = proxies.spawn(at(0.0));
        feed.publish_with(0, 0.0, 1.0, |pull| {
            for handle in [live, gone] {
                pull.constraints.push(ConstraintResult {
                    handle,
                    linear_impulse: Vec3::X,
                    angular_impulse: Vec3::ZERO,
                    broken: false,
                });
                pull.aggregates.push(AggregateResult {
                    handle,
                    pieces: vec![at(1.0), at(2.0)].into(),
                });
            }
        });
        proxies.despawn(gone).unwrap();

        let mut rm = ResultsManager::new(config());
        let r = rm.pull_async(&mut mm, &mut proxies, 0.5);
        assert!(r.aggregate(gone).is_none());
        assert_eq!(r.aggregate(live).unwrap().pieces.len(), 2);
        assert_eq!(r.constraints().map(|c| c.handle).collect::<Vec<_>>(), vec![live]);
        let next = r.next().unwrap();
        assert!(next.constraints.iter().all(|c| c.handle == live));
        assert!(next.aggregates.iter().all(|a| a.handle == live));
        let mut m = PipelineMetrics::default();
        rm.fill(&mut m);
        assert_eq!(m.stale_results_dropped, 2);

        // Despawned after consumption: hidden from the view as well.
        proxies.despawn(live).unwrap();
        let r = rm.pull_async(&mut mm, &mut proxies, 0.75);
        assert!(r.aggregate(live).is_none());
        assert_eq!(r.aggregates().count(), 0);
        assert_eq!(r.constraints().count(), 0);
    }

    #[test]
    fn history_bounds_held_snapshots() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        let h = proxies.spawn(at(0.0));
        let mut rm = ResultsManager::new(InterpolationConfig {
            result_history: 2,
            ..config()
        });
        for i in 0..20u64 {
            feed.publish(i, i as f64, i as f64 + 1.0, &[(h, i as f32)]);
            rm.pull_async(&mut mm, &mut proxies, i as f64 + 0.5);
            assert!(rm.held_snapshots() <= 4);
        }
        assert!(feed.sim.pull_backing_allocations() <= 5);
    }

    #[test]
    #[should_panic(expected = "not after")]
    fn out_of_order_sim_timestamps_assert() {
        let (mut mm, sim) = link(0);
        let mut feed = Feed::new(sim);
        let mut proxies = ProxyArena::new();
        feed.publish(0, 0.0, 1.0, &[]);
        feed.sim_ts = 0;
        feed.publish(1, 1.0, 2.0, &[]);
        let mut rm = ResultsManager::new(config());
        rm.pull_sync(&mut mm, &mut proxies);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn factor_strictly_inside_open_interval(
                start in 0.0f64..1000.0,
                len in 0.001f64..10.0,
                frac in 0.001f64..0.999,
            ) {
                let (mut mm, sim) = link(0);
                let mut feed = Feed::new(sim);
                let mut proxies = ProxyArena::new();
                feed.publish(0, start, start + len, &[]);
                let mut rm = ResultsManager::new(config());
                let query = start + len * frac;
                prop_assume!(query > 0.0);
                let r = rm.pull_async(&mut mm, &mut proxies, query);
                prop_assert!(r.alpha() > 0.0 && r.alpha() < 1.0);
            }
        }
    }
}

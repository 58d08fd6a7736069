//! Recruiting a new epoch on top of a frozen predecessor: primary,
//! satellite, and remote log sets plus the log routers that bridge
//! generations.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver};
use tracing::{debug, info, warn};

use crate::cluster::cell::Shutdown;
use crate::cluster::interface::{
    InitializeLogRouterRequest, InitializeLogServerRequest, OptionalEndpoint, RecruitmentId,
    ReplicaError, ServerCell, StoreType, WorkerClient,
};
use crate::cluster::log_set::{LogSet, LogSetParams};
use crate::cluster::log_system::{LogSystem, LogSystemParts, OldGeneration, PhaseState};
use crate::cluster::recovery::{get_durable_version, RecoveryError};
use crate::core::{LocalityData, ReplicationPolicy, Tag, TagLocality, Version};

/// Replication shape of one auxiliary region tier.
#[derive(Clone)]
pub struct TierConfig {
    pub replication_factor: usize,
    pub write_anti_quorum: usize,
    pub policy: ReplicationPolicy,
}

/// The database configuration slice recruitment needs.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub store_type: StoreType,
    pub replication_factor: usize,
    pub write_anti_quorum: usize,
    pub policy: ReplicationPolicy,
    pub satellite: Option<TierConfig>,
    pub remote: Option<TierConfig>,
}

/// Workers offered for the primary region.
pub struct Recruits {
    pub log_workers: Vec<Arc<dyn WorkerClient>>,
    pub satellite_workers: Vec<Arc<dyn WorkerClient>>,
    pub old_router_workers: Vec<Arc<dyn WorkerClient>>,
}

/// Workers offered for the remote region, delivered asynchronously.
pub struct RemoteRecruits {
    pub log_workers: Vec<Arc<dyn WorkerClient>>,
    pub router_workers: Vec<Arc<dyn WorkerClient>>,
}

pub struct NewEpochRequest {
    pub recruits: Recruits,
    pub remote_recruits: Option<Receiver<RemoteRecruits>>,
    pub db_config: DatabaseConfig,
    pub epoch: u64,
    pub primary_locality: TagLocality,
    pub remote_locality: TagLocality,
    pub all_tags: Vec<Tag>,
}

fn worker_localities(workers: &[Arc<dyn WorkerClient>]) -> Vec<LocalityData> {
    workers.iter().map(|worker| worker.locality()).collect()
}

/// Derive a recruit's start version from the predecessor's lock result for
/// `locality`, waiting until the locked set presents a durable version.
fn derive_start_version(
    old: &Arc<LogSystem>,
    locality: TagLocality,
    default: Version,
    skip_current_local: bool,
    shutdown: &Shutdown,
) -> Result<Version, RecoveryError> {
    for lock in old.lock_results() {
        if lock.set.locality != locality {
            continue;
        }
        if skip_current_local && lock.is_current && lock.set.is_local {
            return Ok(default);
        }
        loop {
            if let Some((kcv, _end)) =
                get_durable_version(old.dbgid(), &lock, None, None, old.config())
            {
                let bound = std::cmp::min(kcv.next(), lock.epoch_end);
                return Ok(std::cmp::min(default, bound));
            }
            if shutdown.wait(Duration::from_millis(50)) {
                return Err(RecoveryError::Cancelled);
            }
        }
    }
    Ok(default)
}

/// Initialize log servers on `workers` in parallel; the reply order matches
/// the request order.
fn initialize_servers(
    workers: &[Arc<dyn WorkerClient>],
    requests: Vec<InitializeLogServerRequest>,
    timeout: Duration,
) -> Result<Vec<OptionalEndpoint>, RecoveryError> {
    debug_assert_eq!(workers.len(), requests.len());
    let (tx, rx) = unbounded::<(usize, Result<OptionalEndpoint, ReplicaError>)>();
    for (idx, (worker, request)) in workers.iter().zip(requests).enumerate() {
        let worker = Arc::clone(worker);
        let tx = tx.clone();
        std::thread::spawn(move || {
            let _ = tx.send((idx, worker.initialize_log_server(request)));
        });
    }
    drop(tx);

    let mut replies: Vec<Option<OptionalEndpoint>> = vec![None; workers.len()];
    for _ in 0..workers.len() {
        match rx.recv_timeout(timeout) {
            Ok((idx, Ok(endpoint))) => replies[idx] = Some(endpoint),
            Ok((_, Err(err))) => {
                warn!(%err, "log server initialization failed");
                return Err(RecoveryError::RecoveryFailed);
            }
            Err(_) => return Err(RecoveryError::RecoveryFailed),
        }
    }
    Ok(replies.into_iter().map(|r| r.expect("reply recorded")).collect())
}

fn initialize_routers(
    workers: &[Arc<dyn WorkerClient>],
    requests: Vec<(usize, InitializeLogRouterRequest)>,
    timeout: Duration,
) -> Result<Vec<OptionalEndpoint>, RecoveryError> {
    let (tx, rx) = unbounded::<(usize, Result<OptionalEndpoint, ReplicaError>)>();
    let count = requests.len();
    for (slot, (worker_idx, request)) in requests.into_iter().enumerate() {
        let worker = Arc::clone(&workers[worker_idx]);
        let tx = tx.clone();
        std::thread::spawn(move || {
            let _ = tx.send((slot, worker.initialize_log_router(request)));
        });
    }
    drop(tx);

    let mut replies: Vec<Option<OptionalEndpoint>> = vec![None; count];
    for _ in 0..count {
        match rx.recv_timeout(timeout) {
            Ok((slot, Ok(endpoint))) => replies[slot] = Some(endpoint),
            Ok((_, Err(err))) => {
                warn!(%err, "log router initialization failed");
                return Err(RecoveryError::RecoveryFailed);
            }
            Err(_) => return Err(RecoveryError::RecoveryFailed),
        }
    }
    Ok(replies.into_iter().map(|r| r.expect("reply recorded")).collect())
}

/// Recruit log routers for the historical generations of `locality` inside
/// `system`, so a new recruit whose start version opens a peek gap can read
/// old generations through routers.
pub(crate) fn recruit_old_log_routers(
    system: &Arc<LogSystem>,
    workers: &[Arc<dyn WorkerClient>],
    recovery_count: u64,
    locality: TagLocality,
    start_version: Version,
    log_localities: Vec<LocalityData>,
    log_policy: ReplicationPolicy,
    has_best_policy: bool,
    for_remote: bool,
) -> Result<(), RecoveryError> {
    if workers.is_empty() {
        warn!("no workers offered for old log router recruitment");
        return Ok(());
    }
    let timeout = system.config().replica_timeout() * 4;
    let mut next_worker = 0usize;
    let mut last_start = Version::MAX;

    let mut recruit_group = |sets: Vec<Arc<LogSet>>,
                             router_tags: usize,
                             group_start: Version,
                             append: &dyn Fn(Arc<LogSet>)|
     -> Result<(), RecoveryError> {
        for set in &sets {
            set.clear_routers();
        }
        let mut targets: Vec<Arc<LogSet>> = sets
            .iter()
            .filter(|set| set.locality == locality)
            .cloned()
            .collect();
        if targets.is_empty() {
            debug!(?locality, start = %group_start, "adding router-only set for locality");
            let placeholder = Arc::new(LogSet::router_only(locality, group_start));
            append(Arc::clone(&placeholder));
            targets.push(placeholder);
        }
        for target in targets {
            let mut requests = Vec::new();
            for i in 0..router_tags {
                requests.push((
                    next_worker,
                    InitializeLogRouterRequest {
                        recovery_count,
                        router_tag: Tag::log_router(i as u16),
                        start_version: group_start,
                        log_localities: log_localities.clone(),
                        log_policy: log_policy.clone(),
                        has_best_policy,
                        locality,
                    },
                ));
                next_worker = (next_worker + 1) % workers.len();
            }
            let endpoints = initialize_routers(workers, requests, timeout)?;
            let cells: Vec<ServerCell> = endpoints
                .into_iter()
                .map(crate::cluster::interface::server_cell)
                .collect();
            if !for_remote {
                for cell in &cells {
                    system.failure_observer().watch(
                        Arc::clone(cell),
                        system.tasks(),
                        system.config(),
                    );
                }
            }
            target.set_routers(cells);
        }
        Ok(())
    };

    if !for_remote {
        let local_max = system
            .local_sets()
            .iter()
            .map(|set| set.start_version)
            .max()
            .unwrap_or(Version::ZERO);
        last_start = std::cmp::max(start_version, local_max);
        if system.log_router_tags == 0 {
            system.config_changed().trigger();
            return Ok(());
        }
        let sets = system.current_sets();
        let system_for_append = Arc::clone(system);
        recruit_group(
            sets,
            system.log_router_tags,
            last_start,
            &move |set| system_for_append.push_current_set(set),
        )?;
    }

    for old in system.old_generations() {
        let local_max = old.local_begin();
        if old.log_router_tags == 0 || local_max >= last_start {
            break;
        }
        last_start = std::cmp::max(start_version, local_max);
        let old_for_append = Arc::clone(&old);
        recruit_group(
            old.log_sets(),
            old.log_router_tags,
            last_start,
            &move |set| old_for_append.push_set(set),
        )?;
    }

    system.config_changed().trigger();
    Ok(())
}

/// Recruit a new epoch immediately following `old` (a frozen log system
/// published by epoch end). The returned system is provisional until the
/// caller commits the coordinated core state.
pub fn new_epoch(
    old: &Arc<LogSystem>,
    req: NewEpochRequest,
) -> Result<Arc<LogSystem>, RecoveryError> {
    let dbgid = old.dbgid();
    let config = old.config().clone();
    let recruitment_id = RecruitmentId::random();
    old.set_recruitment_id(recruitment_id);

    let Some(old_epoch_end) = old.epoch_end else {
        return Err(RecoveryError::Internal(
            "new epoch requires a frozen predecessor".to_string(),
        ));
    };
    let known_committed = old.known_committed;
    let shutdown = old.shutdown_token();

    let primary_localities = worker_localities(&req.recruits.log_workers);
    let log_router_tags = if req.db_config.remote.is_some() {
        req.recruits.log_workers.len()
    } else {
        0
    };

    // The primary set starts at the predecessor's committed frontier unless
    // its locality's lock result proves an earlier durable bound.
    let mut primary_start = known_committed.next();
    primary_start = derive_start_version(
        old,
        req.primary_locality,
        primary_start,
        true,
        &shutdown,
    )?;

    let primary_set = Arc::new(
        LogSet::new(LogSetParams {
            endpoints: req
                .recruits
                .log_workers
                .iter()
                .map(|_| OptionalEndpoint::vacant())
                .collect(),
            localities: primary_localities.clone(),
            replication_factor: req.db_config.replication_factor,
            write_anti_quorum: req.db_config.write_anti_quorum,
            policy: req.db_config.policy.clone(),
            locality: req.primary_locality,
            is_local: true,
            has_best_policy: true,
            start_version: primary_start,
        })
        .map_err(|err| RecoveryError::Internal(err.to_string()))?,
    );

    let satellite_set = match &req.db_config.satellite {
        Some(tier) => Some(Arc::new(
            LogSet::new(LogSetParams {
                endpoints: req
                    .recruits
                    .satellite_workers
                    .iter()
                    .map(|_| OptionalEndpoint::vacant())
                    .collect(),
                localities: worker_localities(&req.recruits.satellite_workers),
                replication_factor: tier.replication_factor,
                write_anti_quorum: tier.write_anti_quorum,
                policy: tier.policy.clone(),
                locality: TagLocality::INVALID,
                is_local: true,
                has_best_policy: false,
                start_version: known_committed.next(),
            })
            .map_err(|err| RecoveryError::Internal(err.to_string()))?,
        )),
        None => None,
    };

    // History: the predecessor's current sets become the newest generation.
    let mut history: Vec<Arc<OldGeneration>> = Vec::new();
    let old_current = old.current_sets();
    if !old_current.is_empty() {
        history.push(Arc::new(OldGeneration::new(
            old_current,
            old.log_router_tags,
            known_committed.next(),
        )));
    }
    history.extend(old.old_generations());

    let mut parts = LogSystemParts::empty(dbgid, old.locality().clone(), config.clone());
    parts.sets = vec![Arc::clone(&primary_set)];
    if let Some(satellite) = &satellite_set {
        parts.sets.push(Arc::clone(satellite));
    }
    parts.old = history;
    parts.log_router_tags = log_router_tags;
    parts.expected_log_sets =
        1 + usize::from(satellite_set.is_some()) + usize::from(req.db_config.remote.is_some());
    parts.recruitment_id = recruitment_id;
    let system = LogSystem::from_parts(parts);

    info!(
        dbgid = ?dbgid,
        start_version = %primary_start,
        epoch_end = %known_committed.next(),
        locality = ?req.primary_locality,
        "new epoch start version"
    );

    // Old log routers bridge the peek gap the early start version opens.
    if primary_start < known_committed.next() {
        recruit_old_log_routers(
            old,
            &req.recruits.old_router_workers,
            req.epoch,
            req.primary_locality,
            primary_start,
            primary_localities.clone(),
            req.db_config.policy.clone(),
            true,
            false,
        )?;
    } else {
        old.config_changed().trigger();
    }

    let recover_from = old.get_log_system_config();
    let timeout = config.replica_timeout() * 4;

    let mut primary_requests: Vec<InitializeLogServerRequest> = (0..req
        .recruits
        .log_workers
        .len())
        .map(|i| InitializeLogServerRequest {
            recruitment_id,
            store_type: req.db_config.store_type,
            recover_from: recover_from.clone(),
            recover_at: old_epoch_end,
            known_committed,
            epoch: req.epoch,
            locality: req.primary_locality,
            remote_tag: Some(Tag::remote_log(i as u16)),
            is_primary: true,
            all_tags: req.all_tags.clone(),
            start_version: primary_start,
            log_router_tags,
            recover_tags: Vec::new(),
        })
        .collect();

    // Route each historical router tag to its best primary location, and
    // every data tag to the primary replicas that will own it.
    for i in 0..old.log_router_tags {
        let tag = Tag::log_router(i as u16);
        if let Some(loc) = primary_set.best_location_for(tag) {
            primary_requests[loc].recover_tags.push(tag);
        }
    }
    for &tag in &req.all_tags {
        for loc in primary_set.push_locations_for(tag) {
            if !primary_requests[loc].recover_tags.contains(&tag) {
                primary_requests[loc].recover_tags.push(tag);
            }
        }
    }

    if let (Some(satellite), Some(_tier)) = (&satellite_set, &req.db_config.satellite) {
        let mut satellite_requests: Vec<InitializeLogServerRequest> = (0..req
            .recruits
            .satellite_workers
            .len())
            .map(|_| InitializeLogServerRequest {
                recruitment_id,
                store_type: req.db_config.store_type,
                recover_from: recover_from.clone(),
                recover_at: old_epoch_end,
                known_committed,
                epoch: req.epoch,
                locality: TagLocality::INVALID,
                remote_tag: None,
                is_primary: true,
                all_tags: req.all_tags.clone(),
                start_version: known_committed.next(),
                log_router_tags,
                recover_tags: Vec::new(),
            })
            .collect();
        for &tag in &req.all_tags {
            for loc in satellite.push_locations_for(tag) {
                if !satellite_requests[loc].recover_tags.contains(&tag) {
                    satellite_requests[loc].recover_tags.push(tag);
                }
            }
        }
        let replies = initialize_servers(
            &req.recruits.satellite_workers,
            satellite_requests,
            timeout,
        )?;
        for (cell, endpoint) in satellite.servers.iter().zip(replies) {
            cell.set(endpoint);
        }
    }

    let replies = initialize_servers(&req.recruits.log_workers, primary_requests, timeout)?;
    for (cell, endpoint) in primary_set.servers.iter().zip(replies) {
        cell.set(endpoint);
    }

    // Watch the recruited replicas and collect their recovery-finished
    // acknowledgments in the background.
    let mut recovery_targets: Vec<ServerCell> = primary_set.servers.to_vec();
    if let Some(satellite) = &satellite_set {
        recovery_targets.extend(satellite.servers.iter().cloned());
    }
    for cell in &recovery_targets {
        system
            .failure_observer()
            .watch(Arc::clone(cell), system.tasks(), system.config());
    }
    spawn_recovery_finished(&system, recovery_targets, req.db_config.remote.is_none());

    if req.db_config.remote.is_some() {
        system.set_has_remote_servers(true);
        spawn_new_remote_epoch(&system, old, req)?;
    }

    Ok(system)
}

/// Collect `recovery_finished` acknowledgments from every recruited replica
/// and latch the local recovery phase (and, when no remote region exists,
/// the remote phases too — they alias local completion).
fn spawn_recovery_finished(system: &Arc<LogSystem>, cells: Vec<ServerCell>, alias_remote: bool) {
    let shutdown = system.tasks().shutdown().clone();
    let weak = Arc::downgrade(system);
    system.tasks().spawn("recovery-finished", move || {
        let (tx, rx) = unbounded::<Result<(), ReplicaError>>();
        let total = cells.len();
        for cell in cells {
            let tx = tx.clone();
            std::thread::spawn(move || {
                let endpoint = cell.get();
                let result = match endpoint.client {
                    Some(client) => client.recovery_finished(),
                    None => Err(ReplicaError::BrokenPromise),
                };
                let _ = tx.send(result);
            });
        }
        drop(tx);

        let mut outcome = PhaseState::Done;
        let mut received = 0;
        while received < total {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(Ok(())) => received += 1,
                Ok(Err(_)) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                    outcome = PhaseState::Failed(RecoveryError::RecoveryFailed);
                    break;
                }
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                    if shutdown.is_triggered() {
                        return;
                    }
                }
            }
        }
        if let Some(system) = weak.upgrade() {
            system.recovery_complete.set(outcome.clone());
            if alias_remote {
                system.remote_recovery.set(outcome.clone());
                system.remote_recovery_complete.set(outcome);
            }
        }
    });
}

/// Drive the remote region's recruitment: wait for the remote workers,
/// derive the remote start version from the predecessor's lock results,
/// recruit routers and remote log servers, and install the completed set.
fn spawn_new_remote_epoch(
    system: &Arc<LogSystem>,
    old: &Arc<LogSystem>,
    req: NewEpochRequest,
) -> Result<(), RecoveryError> {
    let Some(remote_rx) = req.remote_recruits else {
        return Err(RecoveryError::Internal(
            "remote region configured without remote recruits".to_string(),
        ));
    };
    let Some(remote_tier) = req.db_config.remote.clone() else {
        return Err(RecoveryError::Internal(
            "remote recruits without remote configuration".to_string(),
        ));
    };

    let old = Arc::clone(old);
    let shutdown = system.tasks().shutdown().clone();
    let weak = Arc::downgrade(system);
    system.tasks().spawn("new-remote-epoch", move || {
        // The owning system joins this thread on drop; hold it weakly so the
        // drop can begin at all.
        let fail = |weak: &std::sync::Weak<LogSystem>| {
            if let Some(sys) = weak.upgrade() {
                sys.remote_recovery
                    .set(PhaseState::Failed(RecoveryError::RecoveryFailed));
                sys.remote_recovery_complete
                    .set(PhaseState::Failed(RecoveryError::RecoveryFailed));
            }
        };

        debug!("remote log recruitment waiting for workers");
        let remote = loop {
            match remote_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(remote) => break remote,
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                    if shutdown.is_triggered() {
                        return;
                    }
                }
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                    fail(&weak);
                    return;
                }
            }
        };

        let known_committed = old.known_committed;
        let mut remote_start = known_committed.next();
        match derive_start_version(&old, req.remote_locality, remote_start, false, &shutdown) {
            Ok(version) => remote_start = version,
            Err(_) => return,
        }

        let remote_localities = worker_localities(&remote.log_workers);

        let Some(system) = weak.upgrade() else {
            return;
        };
        if remote_start < known_committed.next() {
            if recruit_old_log_routers(
                &system,
                &remote.router_workers,
                req.epoch,
                req.remote_locality,
                remote_start,
                remote_localities.clone(),
                remote_tier.policy.clone(),
                true,
                true,
            )
            .is_err()
            {
                drop(system);
                fail(&weak);
                return;
            }
        }

        let recover_from = old.get_log_system_config();
        let timeout = system.config().replica_timeout() * 4;
        let recruitment_id = system.recruitment_id();
        let Some(old_epoch_end) = old.epoch_end else {
            drop(system);
            fail(&weak);
            return;
        };

        // Routers first: they serve the remote replicas' recovery reads.
        let local_start = system
            .local_sets()
            .first()
            .map(|set| set.start_version)
            .unwrap_or(Version::ZERO);
        let log_router_tags = system.log_router_tags;
        drop(system);

        let router_start = std::cmp::max(local_start, remote_start);
        let mut router_requests = Vec::new();
        for i in 0..log_router_tags {
            router_requests.push((
                i % remote.router_workers.len().max(1),
                InitializeLogRouterRequest {
                    recovery_count: req.epoch,
                    router_tag: Tag::log_router(i as u16),
                    start_version: router_start,
                    log_localities: remote_localities.clone(),
                    log_policy: remote_tier.policy.clone(),
                    has_best_policy: true,
                    locality: req.remote_locality,
                },
            ));
        }
        let routers = if remote.router_workers.is_empty() {
            Vec::new()
        } else {
            match initialize_routers(&remote.router_workers, router_requests, timeout) {
                Ok(routers) => routers,
                Err(_) => {
                    fail(&weak);
                    return;
                }
            }
        };

        let remote_requests: Vec<InitializeLogServerRequest> = (0..remote.log_workers.len())
            .map(|i| InitializeLogServerRequest {
                recruitment_id,
                store_type: req.db_config.store_type,
                recover_from: recover_from.clone(),
                recover_at: old_epoch_end,
                known_committed,
                epoch: req.epoch,
                locality: req.remote_locality,
                remote_tag: Some(Tag::remote_log(i as u16)),
                is_primary: false,
                all_tags: req.all_tags.clone(),
                start_version: remote_start,
                log_router_tags: 0,
                recover_tags: Vec::new(),
            })
            .collect();
        let replies = match initialize_servers(&remote.log_workers, remote_requests, timeout) {
            Ok(replies) => replies,
            Err(_) => {
                fail(&weak);
                return;
            }
        };

        let remote_set = match LogSet::new(LogSetParams {
            endpoints: replies,
            localities: remote_localities,
            replication_factor: remote_tier.replication_factor,
            write_anti_quorum: remote_tier.write_anti_quorum,
            policy: remote_tier.policy.clone(),
            locality: req.remote_locality,
            is_local: false,
            has_best_policy: true,
            start_version: remote_start,
        }) {
            Ok(set) => Arc::new(set),
            Err(err) => {
                warn!(%err, "remote log set construction failed");
                fail(&weak);
                return;
            }
        };
        remote_set.set_routers(
            routers
                .into_iter()
                .map(crate::cluster::interface::server_cell)
                .collect(),
        );

        let Some(system) = weak.upgrade() else {
            return;
        };
        let remote_cells: Vec<ServerCell> = remote_set.servers.to_vec();
        for cell in &remote_cells {
            system
                .failure_observer()
                .watch(Arc::clone(cell), system.tasks(), system.config());
        }
        system.push_current_set(Arc::clone(&remote_set));
        system.remote_recovery.set(PhaseState::Done);
        drop(system);
        info!("remote log recruitment completing recovery");

        // Remote recovery-finished fan-out.
        let mut outcome = PhaseState::Done;
        let (tx, rx) = unbounded::<Result<(), ReplicaError>>();
        let total = remote_cells.len();
        for cell in remote_cells {
            let tx = tx.clone();
            std::thread::spawn(move || {
                let endpoint = cell.get();
                let result = match endpoint.client {
                    Some(client) => client.recovery_finished(),
                    None => Err(ReplicaError::BrokenPromise),
                };
                let _ = tx.send(result);
            });
        }
        drop(tx);
        let mut received = 0;
        while received < total {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(Ok(())) => received += 1,
                Ok(Err(_)) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                    outcome = PhaseState::Failed(RecoveryError::RecoveryFailed);
                    break;
                }
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                    if shutdown.is_triggered() {
                        return;
                    }
                }
            }
        }
        if let Some(system) = weak.upgrade() {
            system.remote_recovery_complete.set(outcome);
        }
    });
    Ok(())
}

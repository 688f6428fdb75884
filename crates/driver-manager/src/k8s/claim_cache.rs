//! ResourceClaim cache with watch capabilities
//!
//! Keeps the set of pod UIDs that hold a ResourceClaim allocated by the NVIDIA
//! GPU DRA driver, so the eviction path can answer "does this pod use a GPU"
//! without a round trip per pod.
//!
//! Two background tasks cooperate through a channel:
//! - the feed watches ResourceClaims and turns watch events into
//!   [`ClaimEvent`]s, remembering the last seen object so updates carry both
//!   the old and the new claim;
//! - the event loop owns all writes to the membership set.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::k8s::gpu_pods::GpuClaimLookup;
use crate::k8s::resource_claim::ResourceClaim;
use crate::k8s::KubernetesError;

/// Maximum time to wait for the initial claim listing.
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

const EVENT_CHANNEL_CAPACITY: usize = 256;
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// A change to a watched ResourceClaim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimEvent {
    Added(ResourceClaim),
    Updated {
        old: ResourceClaim,
        new: ResourceClaim,
    },
    Deleted(ResourceClaim),
    /// Every claim of the initial listing has been delivered.
    Synced,
}

/// Set of pod UIDs bound to an NVIDIA GPU ResourceClaim.
pub struct ResourceClaimCache {
    pod_uids: RwLock<HashSet<String>>,
    synced: watch::Sender<bool>,
}

impl Default for ResourceClaimCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceClaimCache {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            pod_uids: RwLock::new(HashSet::new()),
            synced,
        }
    }

    /// Starts watching ResourceClaims cluster-wide and blocks until the
    /// initial listing has been applied.
    ///
    /// The returned tasks run until `cancellation_token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::CacheSyncTimeout`] if the listing does not complete
    ///   within [`CACHE_SYNC_TIMEOUT`]
    pub async fn start(
        client: Client,
        cancellation_token: CancellationToken,
    ) -> Result<(Arc<Self>, Vec<JoinHandle<()>>), Report<KubernetesError>> {
        let cache = Arc::new(Self::new());
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let token = cancellation_token.child_token();

        let feed_task = {
            let api: Api<ResourceClaim> = Api::all(client);
            let token = token.clone();
            tokio::spawn(async move {
                info!("Starting ResourceClaim feed task");
                run_feed(api, event_tx, token).await;
                info!("ResourceClaim feed task completed");
            })
        };

        let event_task = {
            let cache = cache.clone();
            let token = token.clone();
            tokio::spawn(async move {
                cache.run_events(event_rx, token).await;
            })
        };

        if let Err(e) = cache.wait_until_synced(CACHE_SYNC_TIMEOUT).await {
            token.cancel();
            return Err(e);
        }

        Ok((cache, vec![feed_task, event_task]))
    }

    /// Returns true once the initial listing has been applied.
    ///
    /// Queries before that are answered but may under-report.
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits for the initial listing to be applied.
    pub async fn wait_until_synced(&self, timeout: Duration) -> Result<(), Report<KubernetesError>> {
        let mut synced_rx = self.synced.subscribe();
        tokio::time::timeout(timeout, synced_rx.wait_for(|synced| *synced))
            .await
            .map_err(|_| Report::new(KubernetesError::CacheSyncTimeout { timeout }))?
            .map_err(|_| {
                Report::new(KubernetesError::WatchFailed {
                    message: "claim cache closed before the initial sync".to_string(),
                })
            })?;
        Ok(())
    }

    /// Returns true if the pod with the given UID has reserved an NVIDIA GPU claim.
    pub fn pod_uses_nvidia_gpu(&self, pod_uid: &str) -> bool {
        self.pod_uids.read().expect("poisoned").contains(pod_uid)
    }

    /// Applies events until the channel closes or the token is cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run_events(
        &self,
        mut events: mpsc::Receiver<ClaimEvent>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("ResourceClaim cache shutdown requested");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => {
                        warn!("ResourceClaim event channel closed");
                        break;
                    }
                }
            }
        }
    }

    /// Applies a single event to the membership set.
    pub fn apply(&self, event: ClaimEvent) {
        match event {
            ClaimEvent::Added(claim) => {
                let mut pod_uids = self.pod_uids.write().expect("poisoned");
                update_pod_uids(&mut pod_uids, &claim, true);
            }
            ClaimEvent::Updated { old, new } => {
                let mut pod_uids = self.pod_uids.write().expect("poisoned");
                update_pod_uids(&mut pod_uids, &old, false);
                update_pod_uids(&mut pod_uids, &new, true);
            }
            ClaimEvent::Deleted(claim) => {
                let mut pod_uids = self.pod_uids.write().expect("poisoned");
                update_pod_uids(&mut pod_uids, &claim, false);
            }
            ClaimEvent::Synced => {
                self.synced.send_replace(true);
                info!("ResourceClaim cache synced successfully");
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pod_uids.read().expect("poisoned").len()
    }
}

impl GpuClaimLookup for ResourceClaimCache {
    fn pod_uses_nvidia_gpu(&self, pod_uid: &str) -> bool {
        ResourceClaimCache::pod_uses_nvidia_gpu(self, pod_uid)
    }
}

/// Adds or removes the claim's reserved pods. Claims not allocated by the
/// NVIDIA GPU driver never touch the set.
fn update_pod_uids(pod_uids: &mut HashSet<String>, claim: &ResourceClaim, add: bool) {
    if !claim.is_nvidia_gpu_claim() {
        return;
    }

    for uid in claim.reserved_pod_uids() {
        if add {
            debug!(claim = %claim.name_any(), pod_uid = %uid, "pod reserved NVIDIA GPU claim");
            pod_uids.insert(uid.to_string());
        } else {
            debug!(claim = %claim.name_any(), pod_uid = %uid, "pod released NVIDIA GPU claim");
            pod_uids.remove(uid);
        }
    }
}

/// Watches claims and forwards them as [`ClaimEvent`]s, restarting the watch on errors.
#[tracing::instrument(skip_all)]
async fn run_feed(
    api: Api<ResourceClaim>,
    events: mpsc::Sender<ClaimEvent>,
    cancellation_token: CancellationToken,
) {
    let mut known = HashMap::new();
    let mut synced = false;

    loop {
        select! {
            _ = cancellation_token.cancelled() => {
                info!("ResourceClaim feed shutdown requested");
                break;
            }
            result = watch_claims(&api, &events, &mut known, &mut synced) => {
                match result {
                    Ok(()) => {
                        warn!("ResourceClaim watch stream ended unexpectedly, restarting...");
                    }
                    Err(e) => {
                        error!("ResourceClaim watch failed: {e:?}");
                        if events.is_closed() {
                            break;
                        }
                        select! {
                            _ = cancellation_token.cancelled() => break,
                            _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }
    }
}

async fn watch_claims(
    api: &Api<ResourceClaim>,
    events: &mpsc::Sender<ClaimEvent>,
    known: &mut HashMap<String, ResourceClaim>,
    synced: &mut bool,
) -> Result<(), Report<KubernetesError>> {
    let mut stream = watcher(api.clone(), watcher::Config::default()).boxed();

    while let Some(event) = stream.next().await {
        let event = event.map_err(|e| {
            Report::new(KubernetesError::WatchFailed {
                message: format!("Watch stream error: {e}"),
            })
        })?;
        let is_listing = matches!(event, watcher::Event::Restarted(_));

        for claim_event in translate(known, event) {
            send(events, claim_event).await?;
        }

        if is_listing && !*synced {
            send(events, ClaimEvent::Synced).await?;
            *synced = true;
        }
    }

    Ok(())
}

async fn send(
    events: &mpsc::Sender<ClaimEvent>,
    event: ClaimEvent,
) -> Result<(), Report<KubernetesError>> {
    events.send(event).await.map_err(|_| {
        Report::new(KubernetesError::WatchFailed {
            message: "ResourceClaim event loop is gone".to_string(),
        })
    })
}

fn claim_key(claim: &ResourceClaim) -> String {
    format!(
        "{}/{}",
        claim.namespace().unwrap_or_default(),
        claim.name_any()
    )
}

/// Turns a watch event into add/update/delete events against the last seen
/// state in `known`. A relist also yields deletions for claims that vanished
/// while the watch was down.
fn translate(
    known: &mut HashMap<String, ResourceClaim>,
    event: watcher::Event<ResourceClaim>,
) -> Vec<ClaimEvent> {
    match event {
        watcher::Event::Applied(claim) => applied(known, claim).into_iter().collect(),
        watcher::Event::Deleted(claim) => {
            let last_seen = known.remove(&claim_key(&claim)).unwrap_or(claim);
            vec![ClaimEvent::Deleted(last_seen)]
        }
        watcher::Event::Restarted(claims) => {
            let listed: HashSet<String> = claims.iter().map(claim_key).collect();
            let vanished: Vec<String> = known
                .keys()
                .filter(|key| !listed.contains(*key))
                .cloned()
                .collect();

            let mut out: Vec<ClaimEvent> = vanished
                .into_iter()
                .filter_map(|key| known.remove(&key))
                .map(ClaimEvent::Deleted)
                .collect();
            out.extend(claims.into_iter().filter_map(|claim| applied(known, claim)));
            out
        }
    }
}

fn applied(known: &mut HashMap<String, ResourceClaim>, claim: ResourceClaim) -> Option<ClaimEvent> {
    match known.insert(claim_key(&claim), claim.clone()) {
        None => Some(ClaimEvent::Added(claim)),
        Some(old) if old != claim => Some(ClaimEvent::Updated { old, new: claim }),
        Some(_) => None,
    }
}

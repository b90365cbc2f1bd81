//! `unsafe-remove-dead-replicas`: rewrite the descriptors of ranges that lost
//! their quorum so the local replica becomes the only member.
//!
//! Every rewrite is staged in a single batch and only committed after the
//! operator confirms. Declining, or any failure while staging, leaves the
//! store untouched.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{ensure, Context};
use holo_store::keys::{pretty_key, range_descriptor_key, transaction_key};
use holo_store::mvcc::{
    delete_inline, iterate_range_descriptors, mvcc_put, mvcc_resolve_write_intent, read_store_ident,
};
use holo_store::records::{
    Intent, RangeDescriptor, ReplicaDescriptor, StoreId, StoreIdent, TransactionStatus,
};
use holo_store::{Batch, Engine, FjallEngine, HlcClock, MvccError, OpenOptions, Value, Writer};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("This store's ID ({0}) marked as dead, aborting")]
    LocalStoreMarkedDead(StoreId),
    #[error("expected 1 intent, found {count}: {detail}")]
    UnexpectedIntentCount { count: usize, detail: String },
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub dir: PathBuf,
    pub dead_store_ids: BTreeSet<StoreId>,
}

impl RecoveryConfig {
    pub fn new(dir: impl Into<PathBuf>, dead_store_ids: impl IntoIterator<Item = StoreId>) -> anyhow::Result<Self> {
        let dead_store_ids: BTreeSet<StoreId> = dead_store_ids.into_iter().collect();
        ensure!(!dead_store_ids.is_empty(), "--dead-store-ids must name at least one store");
        ensure!(!dead_store_ids.contains(&0), "store id 0 is not a valid store id");
        Ok(Self {
            dir: dir.into(),
            dead_store_ids,
        })
    }
}

/// A staged descriptor replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRewrite {
    pub old: RangeDescriptor,
    pub new: RangeDescriptor,
}

impl fmt::Display for DescriptorRewrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Replica {} -> {}", self.old, self.new)
    }
}

/// The local store holds a replica and every other replica is on a dead
/// store.
pub fn is_recovery_candidate(desc: &RangeDescriptor, local: StoreId, dead: &BTreeSet<StoreId>) -> bool {
    let has_self = desc.replica_for_store(local).is_some();
    let dead_count = desc
        .replicas
        .iter()
        .filter(|r| dead.contains(&r.store_id))
        .count();
    has_self && dead_count > 0 && dead_count == desc.replicas.len() - 1
}

/// Descriptor with the local replica as the only member, under a fresh
/// replica id.
pub fn rewrite_descriptor(desc: &RangeDescriptor, ident: &StoreIdent) -> RangeDescriptor {
    let mut new = desc.clone();
    new.replicas = vec![ReplicaDescriptor {
        node_id: ident.node_id,
        store_id: ident.store_id,
        replica_id: desc.next_replica_id,
    }];
    new.next_replica_id = desc.next_replica_id + 1;
    new
}

/// Rewrites staged in an uncommitted batch.
pub struct RecoveryPlan<'a> {
    pub rewrites: Vec<DescriptorRewrite>,
    pub batch: Batch<'a>,
}

/// Scan the store and stage a rewrite for every recovery candidate.
pub fn plan_dead_replica_removal<'a>(
    engine: &'a dyn Engine,
    cfg: &RecoveryConfig,
    clock: &HlcClock,
    out: &mut dyn Write,
) -> anyhow::Result<RecoveryPlan<'a>> {
    let ident = read_store_ident(engine)?;
    if cfg.dead_store_ids.contains(&ident.store_id) {
        return Err(RecoveryError::LocalStoreMarkedDead(ident.store_id).into());
    }

    let mut candidates = Vec::new();
    iterate_range_descriptors(engine, &mut |desc| {
        if is_recovery_candidate(&desc, ident.store_id, &cfg.dead_store_ids) {
            candidates.push(desc);
        } else {
            debug!(range_id = desc.range_id, "range keeps a live quorum");
        }
        Ok(true)
    })?;

    let mut batch = Batch::new(engine);
    let mut rewrites = Vec::with_capacity(candidates.len());
    for old in candidates {
        let new = rewrite_descriptor(&old, &ident);
        let key = range_descriptor_key(&old.start_key);
        let value = Value::from_struct(&new)?;
        stage_descriptor_put(&mut batch, &key, &value, clock, out)
            .with_context(|| format!("rewrite descriptor of r{}", old.range_id))?;
        info!(range_id = old.range_id, "staged descriptor rewrite");
        rewrites.push(DescriptorRewrite { old, new });
    }
    Ok(RecoveryPlan { rewrites, batch })
}

/// Put the rewritten descriptor under a fresh timestamp.
///
/// A conflicting intent is aborted once, and a clock behind the existing
/// descriptor version is ratcheted past it once, before the put is retried.
fn stage_descriptor_put(
    batch: &mut Batch<'_>,
    key: &[u8],
    value: &Value,
    clock: &HlcClock,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let mut aborted_intent = false;
    let mut restamped = false;
    loop {
        match mvcc_put(&mut *batch, key, clock.now(), None, value) {
            Ok(()) => return Ok(()),
            Err(MvccError::WriteIntent { intents }) if !aborted_intent => {
                abort_conflicting_intent(&mut *batch, key, intents, out)?;
                aborted_intent = true;
            }
            Err(MvccError::WriteTooOld { existing, .. }) if !restamped => {
                debug!(key = %pretty_key(key), %existing, "clock behind existing descriptor version");
                clock.update(existing);
                restamped = true;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Abort the single transaction holding an intent on `key`: drop its record
/// and clear the intent.
fn abort_conflicting_intent(
    writer: &mut dyn Writer,
    key: &[u8],
    intents: Vec<Intent>,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let count = intents.len();
    let [intent]: [Intent; 1] = intents.try_into().map_err(|intents: Vec<Intent>| {
        let detail = intents
            .iter()
            .map(|i| format!("{} txn={}", pretty_key(&i.key), i.txn.short_id()))
            .collect::<Vec<_>>()
            .join(", ");
        RecoveryError::UnexpectedIntentCount { count, detail }
    })?;
    writeln!(
        out,
        "Conflicting intent found on {}. Aborting txn {} to resolve.",
        pretty_key(key),
        intent.txn.short_id()
    )?;
    delete_inline(writer, &transaction_key(&intent.txn.key, intent.txn.id))?;
    let aborted = Intent {
        status: TransactionStatus::Aborted,
        ..intent
    };
    mvcc_resolve_write_intent(writer, &aborted)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    NothingToDo,
    Committed(Vec<DescriptorRewrite>),
    Aborted,
}

/// Plan the rewrites, show them, and commit only on an explicit `y`.
pub fn remove_dead_replicas(
    engine: &dyn Engine,
    cfg: &RecoveryConfig,
    clock: &HlcClock,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> anyhow::Result<RecoveryOutcome> {
    let plan = plan_dead_replica_removal(engine, cfg, clock, out)?;
    if plan.rewrites.is_empty() {
        writeln!(out, "Nothing to do")?;
        return Ok(RecoveryOutcome::NothingToDo);
    }
    for rewrite in &plan.rewrites {
        writeln!(out, "{rewrite}")?;
    }
    write!(out, "Proceed with the above rewrites? [y/N] ")?;
    out.flush()?;
    let mut line = String::new();
    input.read_line(&mut line).context("read confirmation")?;
    writeln!(out)?;

    if matches!(line.chars().next(), Some('y' | 'Y')) {
        writeln!(out, "Committing")?;
        plan.batch.commit().context("commit descriptor rewrites")?;
        info!(ranges = plan.rewrites.len(), "committed descriptor rewrites");
        Ok(RecoveryOutcome::Committed(plan.rewrites))
    } else {
        writeln!(out, "Aborting")?;
        Ok(RecoveryOutcome::Aborted)
    }
}

pub fn run(cfg: &RecoveryConfig, out: &mut dyn Write) -> anyhow::Result<RecoveryOutcome> {
    let ids: Vec<String> = cfg.dead_store_ids.iter().map(ToString::to_string).collect();
    writeln!(
        out,
        "Scanning replicas on store {} for dead peers [{}]",
        cfg.dir.display(),
        ids.join(", ")
    )?;
    let engine = FjallEngine::open(&cfg.dir, OpenOptions::read_write())?;
    let mut stdin = std::io::stdin().lock();
    remove_dead_replicas(&engine, cfg, &HlcClock::system(), &mut stdin, out)
}

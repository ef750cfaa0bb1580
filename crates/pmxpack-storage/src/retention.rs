//! Retention classifiers.
//!
//! Both policies produce a [`RetentionPlan`] that totally partitions the
//! input listing into keep and delete sets; the caller performs the
//! deletions so the classifiers stay pure and testable.

use std::collections::HashSet;

use chrono::Datelike;

use pmxpack_types::{BackupMetadata, RetentionSettings};

/// Total partition of a backup listing.
#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    /// Backups to keep, newest first.
    pub keep: Vec<BackupMetadata>,
    /// Backups to delete, oldest first.
    pub delete: Vec<BackupMetadata>,
}

/// Classify `backups` under the configured policy.
pub fn plan_retention(settings: &RetentionSettings, backups: Vec<BackupMetadata>) -> RetentionPlan {
    match *settings {
        RetentionSettings::Simple { max_backups } => plan_simple(max_backups, backups),
        RetentionSettings::Gfs { daily, weekly, monthly, yearly } => {
            plan_gfs(daily, weekly, monthly, yearly, backups)
        }
    }
}

/// Keep the newest `max` backups; `max == 0` disables retention.
fn plan_simple(max: u32, mut backups: Vec<BackupMetadata>) -> RetentionPlan {
    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    if max == 0 {
        return RetentionPlan { keep: backups, delete: Vec::new() };
    }

    let max = max as usize;
    if backups.len() <= max {
        return RetentionPlan { keep: backups, delete: Vec::new() };
    }

    let mut delete = backups.split_off(max);
    delete.reverse();
    RetentionPlan { keep: backups, delete }
}

/// Grandfather-father-son classification.
///
/// Buckets are filled newest-first: the most recent backup per day up to
/// `daily`, then the newest backup per ISO week not already covered by a
/// kept backup, then per calendar month, then per calendar year. A
/// period containing an already-kept backup counts as covered.
fn plan_gfs(
    daily: u32,
    weekly: u32,
    monthly: u32,
    yearly: u32,
    mut backups: Vec<BackupMetadata>,
) -> RetentionPlan {
    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut kept: HashSet<String> = HashSet::new();

    let mut seen_days = HashSet::new();
    let mut picked = 0u32;
    for b in &backups {
        if picked >= daily {
            break;
        }
        if seen_days.insert(b.timestamp.date_naive()) {
            kept.insert(b.filename.clone());
            picked += 1;
        }
    }

    let week_key = |b: &BackupMetadata| {
        let week = b.timestamp.iso_week();
        (week.year(), week.week())
    };
    let month_key = |b: &BackupMetadata| (b.timestamp.year(), b.timestamp.month());
    let year_key = |b: &BackupMetadata| b.timestamp.year();

    fill_bucket(&backups, &mut kept, weekly, week_key);
    fill_bucket(&backups, &mut kept, monthly, month_key);
    fill_bucket(&backups, &mut kept, yearly, year_key);

    let mut keep = Vec::new();
    let mut delete = Vec::new();
    for b in backups {
        if kept.contains(&b.filename) {
            keep.push(b);
        } else {
            delete.push(b);
        }
    }
    delete.reverse();
    RetentionPlan { keep, delete }
}

fn fill_bucket<K: std::hash::Hash + Eq>(
    backups: &[BackupMetadata],
    kept: &mut HashSet<String>,
    limit: u32,
    key: impl Fn(&BackupMetadata) -> K,
) {
    // Periods already represented by a kept backup are covered.
    let mut seen: HashSet<K> = backups
        .iter()
        .filter(|b| kept.contains(&b.filename))
        .map(&key)
        .collect();

    let mut picked = 0u32;
    for b in backups {
        if picked >= limit {
            break;
        }
        if kept.contains(&b.filename) {
            continue;
        }
        if seen.insert(key(b)) {
            kept.insert(b.filename.clone());
            picked += 1;
        }
    }
}

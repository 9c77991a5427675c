// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Migration thresholds
//!
//! The up threshold is stored in the big cluster's stats and the down
//! threshold in the little cluster's. With dynamic thresholds the interval
//! between the configured down and up thresholds is split according to the
//! headroom of both sides:
//!
//! ```text
//!                              (B_acap + 1) (B_atask + 1)
//! up   = up_thr   - diff * ---------------------------------------
//!                          (B_acap + L_acap + 1) (B_atask + L_atask + 1)
//!
//!                              (L_acap + 1) (L_atask + 1)
//! down = down_thr + diff * ---------------------------------------
//!                          (B_acap + L_acap + 1) (B_atask + L_atask + 1)
//! ```
//!
//! The big side's headroom is first weighed by the big-to-little compute
//! ratio (1.7). The more room a cluster has, the easier moving work into it
//! becomes and the harder moving work out of it.
//!
//! When one side has no headroom at all the two fractions can add up to more
//! than one, so the result is clamped to keep down <= up.
use log::trace;

use crate::cluster::ClusterStats;
use crate::tunables::Tunables;

/// Assumed compute ratio of a big CPU over a little one.
pub fn hmp_ratio(v: i64) -> i64 {
    v * 17 / 10
}

fn pos(v: i64) -> u64 {
    v.max(0) as u64
}

pub fn adjust_thresholds(tunables: &Tunables, b: &mut ClusterStats, l: &mut ClusterStats) {
    let up = tunables.up_threshold;
    let down = tunables.down_threshold.min(up);

    if !tunables.dynamic_threshold_enabled {
        b.threshold = up;
        l.threshold = down;
        return;
    }

    let diff = (up - down) as u64;
    let b_acap = pos(hmp_ratio(b.scaled_acap));
    let b_atask = pos(hmp_ratio(b.scaled_atask));
    let l_acap = pos(l.scaled_acap);
    let l_atask = pos(l.scaled_atask);

    let acap_sum = b_acap + l_acap + 1;
    let atask_sum = b_atask + l_atask + 1;

    let l_share = diff * (l_acap + 1) * (l_atask + 1) / acap_sum / atask_sum;
    let b_share = diff * (b_acap + 1) * (b_atask + 1) / acap_sum / atask_sum;

    let l_thr = down as u64 + l_share.min(diff);
    let b_thr = (up as u64).saturating_sub(b_share.min(diff));

    b.threshold = b_thr as u32;
    l.threshold = l_thr.min(b_thr) as u32;

    trace!(
        "thresholds up/down={}/{} B(acap={} atask={}) L(acap={} atask={})",
        b.threshold,
        l.threshold,
        b_acap,
        b_atask,
        l_acap,
        l_atask
    );
}

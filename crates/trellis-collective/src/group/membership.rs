//! Membership algebra for group construction
//!
//! Memberships never hold two entries for the same process. A wildcard entry
//! for a job absorbs every specific-rank entry of that job, taking the
//! position of the first one it replaces.

use crate::errors::{CollectiveError, CollectiveResult};
use trellis_core::ProcId;

/// Insert each of `incoming` into `members`, keeping first-seen order
pub fn merge_members(members: &mut Vec<ProcId>, incoming: &[ProcId]) {
    for proc in incoming {
        insert_member(members, proc);
    }
}

fn insert_member(members: &mut Vec<ProcId>, proc: &ProcId) {
    if !proc.rank.is_wildcard() {
        if !members.iter().any(|existing| existing.matches(proc)) {
            members.push(proc.clone());
        }
        return;
    }

    let same_job = |existing: &ProcId| existing.job == proc.job;
    if members
        .iter()
        .any(|existing| same_job(existing) && existing.rank.is_wildcard())
    {
        return;
    }
    match members.iter().position(same_job) {
        Some(first) => {
            members[first] = proc.clone();
            let mut index = 0;
            members.retain(|existing| {
                let keep = index == first || !same_job(existing);
                index += 1;
                keep
            });
        }
        None => members.push(proc.clone()),
    }
}

/// Union of `members` and `add_members`
pub fn union(members: &[ProcId], add_members: &[ProcId]) -> Vec<ProcId> {
    let mut merged = Vec::with_capacity(members.len() + add_members.len());
    merge_members(&mut merged, members);
    merge_members(&mut merged, add_members);
    merged
}

/// Rearrange `membership` to follow `order`.
///
/// Each order entry selects the matching membership entries; a specific-rank
/// entry takes only the first match, a wildcard takes all of them. The
/// result must have as many entries as the membership.
pub fn apply_final_order(membership: &[ProcId], order: &[ProcId]) -> CollectiveResult<Vec<ProcId>> {
    let mut ordered = Vec::with_capacity(membership.len());
    for wanted in order {
        for member in membership {
            if wanted.matches(member) {
                ordered.push(member.clone());
                if !wanted.rank.is_wildcard() {
                    break;
                }
            }
        }
    }
    if ordered.len() != membership.len() {
        return Err(CollectiveError::BadFinalOrder {
            message: format!(
                "order selects {} of {} members",
                ordered.len(),
                membership.len()
            ),
        });
    }
    Ok(ordered)
}

/// Final membership in its released order
pub fn finalize(
    members: &[ProcId],
    add_members: &[ProcId],
    order: Option<&[ProcId]>,
) -> CollectiveResult<Vec<ProcId>> {
    let mut membership = union(members, add_members);
    match order {
        Some(order) => apply_final_order(&membership, order),
        None => {
            membership.sort();
            Ok(membership)
        }
    }
}

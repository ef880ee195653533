//! Block-to-rank assignment.

use crate::error::{MeshError, Result};

/// A distribution of blocks over ranks. Gids owned by one rank are
/// contiguous; `start[r]` is the first gid on rank `r` and `count[r]` how
/// many it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub rank: Vec<usize>,
    pub start: Vec<usize>,
    pub count: Vec<usize>,
}

/// Partitions `costs` over `nranks` ranks with a greedy running sum against
/// the average cost. Assignment walks from the high-gid end downward so that
/// rank 0 receives the residue: the master rank does extra bookkeeping and
/// should carry the lighter load.
pub fn load_balance(costs: &[f64], nranks: usize, adaptive: bool) -> Result<Balance> {
    let nb = costs.len();
    let total: f64 = costs.iter().sum();
    let mut maxcost = 0.0_f64;
    let mut mincost = f64::INFINITY;
    for &cost in costs {
        maxcost = maxcost.max(cost);
        mincost = mincost.min(cost);
    }

    let mut rank = vec![0; nb];
    let mut remaining = total;
    let mut target = total / nranks as f64;
    let mut mycost = 0.0;
    let mut j = nranks - 1;

    for i in (0..nb).rev() {
        if target == 0.0 {
            return Err(MeshError::EmptyRank);
        }
        mycost += costs[i];
        rank[i] = j;
        if mycost >= target && j > 0 {
            j -= 1;
            remaining -= mycost;
            mycost = 0.0;
            target = remaining / (j + 1) as f64;
        }
    }

    let mut start = vec![0; nranks];
    let mut count = vec![0; nranks];
    let mut r = 0;
    for i in 1..nb {
        if rank[i] != rank[i - 1] {
            count[r] = i - start[r];
            r += 1;
            start[r] = i;
        }
    }
    count[r] = nb - start[r];

    if count.iter().any(|&c| c == 0) {
        return Err(MeshError::EmptyRank);
    }

    if nb % nranks != 0 && !adaptive && maxcost == mincost && nranks > 1 {
        log::warn!(
            "the number of blocks ({nb}) cannot be divided evenly over {nranks} ranks; \
             this will cause a poor load balance"
        );
    }

    Ok(Balance { rank, start, count })
}

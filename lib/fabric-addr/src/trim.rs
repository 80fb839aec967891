// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{is_aligned, AddrError, DRAM_DECREMENT};

/// Shrinks a node's per-socket DRAM sizes until their total is at most
/// `limit` and a multiple of `align`, returning the new total.
///
/// Each socket is first rounded down to [`DRAM_DECREMENT`]; after that the
/// largest socket (the lowest-numbered one on a tie) gives up one decrement
/// at a time. `align` must be a power of two no smaller than the decrement.
pub fn trim_node(
    sockets: &mut [u64],
    limit: u64,
    align: u64,
) -> Result<u64, AddrError> {
    if !align.is_power_of_two() || align < DRAM_DECREMENT {
        return Err(AddrError::Misaligned {
            addr: align,
            granularity: DRAM_DECREMENT,
        });
    }

    for s in sockets.iter_mut() {
        *s &= !(DRAM_DECREMENT - 1);
    }
    let mut total: u64 = sockets.iter().sum();

    // Every pass removes one decrement, so this cannot take more passes than
    // there are decrements in the node.
    let mut budget = total / DRAM_DECREMENT;
    while total > limit || !is_aligned(total, align) {
        let Some(big) = largest(sockets) else {
            return Err(AddrError::TrimStuck { size: total });
        };
        if budget == 0 {
            return Err(AddrError::TrimStuck { size: total });
        }
        budget -= 1;
        sockets[big] -= DRAM_DECREMENT;
        total -= DRAM_DECREMENT;
    }
    Ok(total)
}

fn largest(sockets: &[u64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &s) in sockets.iter().enumerate() {
        if s == 0 {
            continue;
        }
        if best.map_or(true, |b| s > sockets[b]) {
            best = Some(i);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    #[test]
    fn compliant_node_is_untouched() {
        let mut s = [16 * GIB, 16 * GIB];
        assert_eq!(trim_node(&mut s, u64::MAX, 16 * GIB), Ok(32 * GIB));
        assert_eq!(s, [16 * GIB, 16 * GIB]);
    }

    #[test]
    fn largest_socket_pays() {
        // 33 GiB total, 16 GiB aligned: the 17 GiB socket loses 1 GiB.
        let mut s = [16 * GIB, 17 * GIB];
        assert_eq!(trim_node(&mut s, u64::MAX, 16 * GIB), Ok(32 * GIB));
        assert_eq!(s, [16 * GIB, 16 * GIB]);
    }

    #[test]
    fn limit_spreads_over_sockets() {
        let mut s = [16 * GIB, 16 * GIB, 16 * GIB, 16 * GIB];
        assert_eq!(trim_node(&mut s, 32 * GIB, 16 * GIB), Ok(32 * GIB));
        assert_eq!(s, [8 * GIB; 4]);
    }

    #[test]
    fn odd_sizes_round_to_decrement() {
        let mut s = [GIB + 5, 0];
        assert_eq!(trim_node(&mut s, u64::MAX, DRAM_DECREMENT), Ok(GIB));
        assert_eq!(s, [GIB, 0]);
    }

    #[test]
    fn empty_node() {
        let mut s: [u64; 0] = [];
        assert_eq!(trim_node(&mut s, 0, 16 * GIB), Ok(0));
        assert!(trim_node(&mut s, 0, 12345).is_err());
    }
}

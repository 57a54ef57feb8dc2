//! Crash recovery: rebuild every piece of volatile state from the block
//! file alone.
//!
//! The scan walks each touched segment's object chain, keeps the copy
//! with the highest allocation sequence per address (wrapping compare),
//! then recounts references by walking the graph from the root object
//! table. Whatever is not reachable from a root did not survive the
//! crash, and its address goes back to the free pool.

use std::collections::HashMap;

use log::{info, warn};

use crate::{
    allocator::Allocator,
    control::{Location, PtrAddress},
    header::{AllocHeader, TYPE_SYNC},
    node::{TYPE_BINARY, TYPE_FULL, TYPE_SETLIST, TYPE_VALUE},
    roots::RootTable,
    segment::{SegmentView, SEGMENT_DATA_END, SEGMENT_DATA_START, SEGMENT_MAGIC},
    vtables, Result, SEGMENT_SIZE,
};

struct Candidate {
    sequence: u16,
    loc: Location,
    size: u32,
}

/// 16-bit sequences wrap; newer-than treats the shorter arc as forward.
fn seq_newer(a: u16, b: u16) -> bool {
    a.wrapping_sub(b) < u16::MAX / 2 && a != b
}

pub fn recover(alloc: &Allocator, roots: &RootTable) -> Result<()> {
    let blocks = alloc.block.num_blocks();
    info!("recovering database state from {blocks} segments");

    // The persisted control-block zones reflect the moment of the crash;
    // none of it is trustworthy. Start from all-free.
    alloc.ctrl.reset_all();

    // Pass 1: collect the newest valid copy of every address.
    let mut winners: HashMap<u32, Candidate> = HashMap::new();
    let mut max_seq = 0u32;
    for seg in 0..blocks {
        let view = alloc.segment_view(seg);
        if view.header().magic != SEGMENT_MAGIC {
            alloc.seg_meta(seg).added_to_free_list();
            continue;
        }
        let end = walk_end(&view);
        view.walk_objects(end, |pos, header| {
            if header.type_tag() == TYPE_SYNC {
                return true;
            }
            if !valid_object(header) {
                // Torn tail write; nothing after it can be trusted.
                return false;
            }
            if header.has_checksum() && !unsafe { header.verify_checksum() } {
                warn!("dropping object with bad checksum in segment {seg} at {pos}");
                return true;
            }
            let addr = header.address().raw();
            let seq = header.sequence();
            max_seq = max_seq.max(seq as u32);
            let loc = Location::from_offset(seg * SEGMENT_SIZE + pos as u64);
            let replace = match winners.get(&addr) {
                Some(c) => seq_newer(seq, c.sequence),
                None => true,
            };
            if replace {
                winners.insert(
                    addr,
                    Candidate {
                        sequence: seq,
                        loc,
                        size: header.size(),
                    },
                );
            }
            true
        });
    }

    // Pass 2: reachability from the root object table.
    let mut reachable: HashMap<u32, u64> = HashMap::new();
    let mut worklist: Vec<PtrAddress> = Vec::new();
    roots.for_each_root(|slot, addr| {
        if winners.contains_key(&addr.raw()) {
            *reachable.entry(addr.raw()).or_insert(0) += 1;
            worklist.push(addr);
        } else {
            warn!("root slot {slot} points at a lost address {addr:?}; clearing");
            let _ = roots.set(slot, PtrAddress::NULL, crate::SyncLevel::MsyncSync);
        }
    });
    let mut visited: std::collections::HashSet<u32> = std::collections::HashSet::new();
    while let Some(addr) = worklist.pop() {
        if !visited.insert(addr.raw()) {
            continue;
        }
        let c = &winners[&addr.raw()];
        let header = unsafe { alloc.object_at(c.loc) };
        let vt = &vtables()[header.type_tag() as usize];
        unsafe {
            (vt.visit_children)(header, &mut |child| {
                if winners.contains_key(&child.raw()) {
                    *reachable.entry(child.raw()).or_insert(0) += 1;
                    worklist.push(child);
                } else {
                    warn!("reachable object references lost child {child:?}");
                }
            });
        }
    }

    // Pass 3: install control blocks for the reachable set and account
    // live bytes per segment.
    let mut live_bytes: HashMap<u64, u64> = HashMap::new();
    for (&addr, refs) in reachable.iter() {
        let c = &winners[&addr];
        let cb = alloc.ctrl.get_or_alloc(PtrAddress::new(addr))?;
        cb.force(c.loc, *refs);
        *live_bytes.entry(c.loc.segment(SEGMENT_SIZE)).or_insert(0) += c.size as u64;
    }
    alloc.ctrl.set_alloc_seq(max_seq + 1);

    // Pass 4: segment metadata. Touched segments become read-only
    // compaction candidates with their true freed space; untouched ones
    // are free.
    let data_span = (SEGMENT_DATA_END - SEGMENT_DATA_START) as u64;
    for seg in 0..blocks {
        let view = alloc.segment_view(seg);
        let meta = alloc.seg_meta(seg);
        if view.header().magic != SEGMENT_MAGIC {
            continue;
        }
        let live = live_bytes.get(&seg).copied().unwrap_or(0);
        if live == 0 {
            meta.added_to_free_list();
        } else {
            meta.prepare_for_compaction(view.footer().vage_ms.load(std::sync::atomic::Ordering::Relaxed));
            meta.freed_space
                .store((data_span - live) as u32, std::sync::atomic::Ordering::Relaxed);
            // Terminate the chain where the scan stopped, then seal;
            // nothing may append to a recovered segment.
            let end = walk_end(&view);
            if end + 64 <= SEGMENT_DATA_END {
                unsafe { std::ptr::write_bytes(view.at(end), 0, 64) };
            }
            view.footer()
                .alloc_pos
                .store(SEGMENT_DATA_END, std::sync::atomic::Ordering::Relaxed);
            view.footer().first_writable_page.store(
                alloc.pages_per_segment as u16,
                std::sync::atomic::Ordering::Relaxed,
            );
        }
    }

    alloc.rebuild_free_bitmap();
    info!(
        "recovery complete: {} live objects, {} reachable addresses",
        winners.len(),
        reachable.len()
    );
    Ok(())
}

fn walk_end(view: &SegmentView) -> u32 {
    let pos = view.alloc_pos();
    if (SEGMENT_DATA_START..=SEGMENT_DATA_END).contains(&pos) {
        pos
    } else {
        SEGMENT_DATA_END
    }
}

fn valid_object(header: &AllocHeader) -> bool {
    let size = header.size();
    if size == 0 || size % 64 != 0 || size as u64 > crate::MAX_OBJECT_SIZE {
        return false;
    }
    matches!(
        header.type_tag(),
        TYPE_BINARY | TYPE_SETLIST | TYPE_FULL | TYPE_VALUE
    ) && !header.address().is_null()
}

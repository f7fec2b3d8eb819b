//! Binary profile serializer (C8, spec §4.8).
//!
//! Layout, outermost to innermost:
//!
//! ```text
//! header:    magic "CSPROF01" | version:u32 | endian:u8 (1 = little)
//! metrics:   count:u32 | { name_len:u16, name, period:u64, flags:u32, kind:u8 }*
//! epochs:    magic "HPC_EPOCH" | count:u32 |
//!              { id:u32, module_count:u32 |
//!                { name_len:u16, name, preferred_vaddr:u64, actual_mapaddr:u64, size:u64 }* }*
//! cct:       state_count:u32 | total_trampoline_samples:u64 |
//!              { epoch_id:u32, num_nodes:u32, ctxt_len:u32, ctxt_entry* , node* }*
//! ```
//!
//! where `ctxt_entry` and `node` share an `assoc_info` encoding
//! (`assoc:u8, len_logical:u32, len_physical:u32, lip_len:u32, lip_bytes`),
//! and `node` additionally carries `parent_dense_id:u32` (0 for the root
//! of that state's tree), `disk_persistent_id:u32`, and its metric vector.
//! Nodes are written in the preorder produced by
//! [`crate::cct::Cct::preorder_with_parents`] (spec §4.8 "A child appears
//! after its parent").
//!
//! When `ctxt_len > 0`, the tree's top two levels — the root and its
//! direct children, the thread's bootstrap frames — are elided from
//! `node*` entirely (spec §4.8); a node that would have parented directly
//! under an elided depth-1 node is written with `parent_dense_id` 0, and
//! a reader with a non-empty `ctxt_entry*` knows to reattach it under the
//! ctxt chain rather than treat it as a second root.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use csprof_unwind::{AsInfo, Assoc};
use rustc_hash::FxHashSet;

use crate::cct::{Cct, ContextChainEntry};
use crate::epoch::Epoch;
use crate::metric::{MetricDescriptor, MetricDescriptorTable, MetricFlags, MetricKind};
use crate::state::ThreadProfilingState;

const MAGIC: &[u8; 8] = b"CSPROF01";
const EPOCH_MAGIC: &[u8; 9] = b"HPC_EPOCH";
const FORMAT_VERSION: u32 = 1;

fn assoc_to_u8(assoc: Assoc) -> u8 {
    match assoc {
        Assoc::Null => 0,
        Assoc::OneToOne => 1,
        Assoc::OneToMany => 2,
        Assoc::ManyToOne => 3,
        Assoc::ManyToMany => 4,
    }
}

fn assoc_from_u8(byte: u8) -> io::Result<Assoc> {
    Ok(match byte {
        0 => Assoc::Null,
        1 => Assoc::OneToOne,
        2 => Assoc::OneToMany,
        3 => Assoc::ManyToOne,
        4 => Assoc::ManyToMany,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown assoc tag {other}"),
            ))
        }
    })
}

fn kind_to_u8(kind: MetricKind) -> u8 {
    match kind {
        MetricKind::Inclusive => 0,
        MetricKind::Exclusive => 1,
        MetricKind::Derived => 2,
    }
}

fn kind_from_u8(byte: u8) -> io::Result<MetricKind> {
    Ok(match byte {
        0 => MetricKind::Inclusive,
        1 => MetricKind::Exclusive,
        2 => MetricKind::Derived,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown metric kind tag {other}"),
            ))
        }
    })
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    w.write_u16::<LittleEndian>(bytes.len() as u16)?;
    w.write_all(bytes)
}

fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = r.read_u16::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_bytes_with_len<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)
}

fn read_bytes_with_len<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_as_info<W: Write>(w: &mut W, info: &AsInfo, lip: Option<&[u8]>) -> io::Result<()> {
    w.write_u8(assoc_to_u8(info.assoc))?;
    w.write_u32::<LittleEndian>(info.len_logical)?;
    w.write_u32::<LittleEndian>(info.len_physical)?;
    write_bytes_with_len(w, lip.unwrap_or(&[]))
}

fn read_as_info<R: Read>(r: &mut R) -> io::Result<(AsInfo, Vec<u8>)> {
    let assoc = assoc_from_u8(r.read_u8()?)?;
    let len_logical = r.read_u32::<LittleEndian>()?;
    let len_physical = r.read_u32::<LittleEndian>()?;
    let lip = read_bytes_with_len(r)?;
    Ok((
        AsInfo {
            assoc,
            len_logical,
            len_physical,
        },
        lip,
    ))
}

pub fn write_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    w.write_u8(1)
}

pub fn read_header<R: Read>(r: &mut R) -> io::Result<()> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported format version {version}"),
        ));
    }
    let endian = r.read_u8()?;
    if endian != 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "big-endian profiles are not supported",
        ));
    }
    Ok(())
}

pub fn write_metrics<W: Write>(w: &mut W, table: &MetricDescriptorTable) -> io::Result<()> {
    let descriptors: Vec<&MetricDescriptor> = table.iter().collect();
    w.write_u32::<LittleEndian>(descriptors.len() as u32)?;
    for d in descriptors {
        write_string(w, &d.name)?;
        w.write_u64::<LittleEndian>(d.period)?;
        w.write_u32::<LittleEndian>(d.flags.to_bits())?;
        w.write_u8(kind_to_u8(d.kind))?;
    }
    Ok(())
}

pub struct ReadMetric {
    pub name: String,
    pub period: u64,
    pub flags: MetricFlags,
    pub kind: MetricKind,
}

pub fn read_metrics<R: Read>(r: &mut R) -> io::Result<Vec<ReadMetric>> {
    let count = r.read_u32::<LittleEndian>()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_string(r)?;
        let period = r.read_u64::<LittleEndian>()?;
        let flags = MetricFlags::from_bits(r.read_u32::<LittleEndian>()?);
        let kind = kind_from_u8(r.read_u8()?)?;
        out.push(ReadMetric {
            name,
            period,
            flags,
            kind,
        });
    }
    Ok(out)
}

/// Write the full epoch chain, oldest first, following `next` pointers
/// back from `newest`.
pub fn write_epochs<W: Write>(w: &mut W, newest: Option<&Epoch>) -> io::Result<()> {
    let mut chain = Vec::new();
    let mut cur = newest;
    while let Some(e) = cur {
        chain.push(e);
        cur = e.next.as_deref();
    }
    chain.reverse();

    w.write_all(EPOCH_MAGIC)?;
    w.write_u32::<LittleEndian>(chain.len() as u32)?;
    for epoch in chain {
        w.write_u32::<LittleEndian>(epoch.id)?;
        w.write_u32::<LittleEndian>(epoch.modules.len() as u32)?;
        for module in &epoch.modules {
            write_string(w, &module.name)?;
            w.write_u64::<LittleEndian>(module.preferred_vaddr)?;
            w.write_u64::<LittleEndian>(module.actual_mapaddr)?;
            w.write_u64::<LittleEndian>(module.size)?;
        }
    }
    Ok(())
}

pub struct ReadEpoch {
    pub id: u32,
    pub modules: Vec<(String, u64, u64, u64)>,
}

pub fn read_epochs<R: Read>(r: &mut R) -> io::Result<Vec<ReadEpoch>> {
    let mut magic = [0u8; 9];
    r.read_exact(&mut magic)?;
    if &magic != EPOCH_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad epoch magic"));
    }
    let count = r.read_u32::<LittleEndian>()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = r.read_u32::<LittleEndian>()?;
        let module_count = r.read_u32::<LittleEndian>()?;
        let mut modules = Vec::with_capacity(module_count as usize);
        for _ in 0..module_count {
            let name = read_string(r)?;
            let preferred_vaddr = r.read_u64::<LittleEndian>()?;
            let actual_mapaddr = r.read_u64::<LittleEndian>()?;
            let size = r.read_u64::<LittleEndian>()?;
            modules.push((name, preferred_vaddr, actual_mapaddr, size));
        }
        out.push(ReadEpoch { id, modules });
    }
    Ok(out)
}

fn write_ctxt_entry<W: Write>(w: &mut W, entry: &ContextChainEntry) -> io::Result<()> {
    w.write_u64::<LittleEndian>(entry.ip)?;
    w.write_u64::<LittleEndian>(entry.sp)?;
    write_as_info(w, &entry.as_info, entry.lip.as_deref())?;
    w.write_u32::<LittleEndian>(entry.persistent_id)
}

fn read_ctxt_entry<R: Read>(r: &mut R) -> io::Result<ContextChainEntry> {
    let ip = r.read_u64::<LittleEndian>()?;
    let sp = r.read_u64::<LittleEndian>()?;
    let (as_info, lip) = read_as_info(r)?;
    let persistent_id = r.read_u32::<LittleEndian>()?;
    Ok(ContextChainEntry {
        ip,
        sp,
        as_info,
        lip: if lip.is_empty() { None } else { Some(lip) },
        persistent_id,
    })
}

/// Write every CCT owned by `states`, in order, each as one "state"
/// record (spec §4.8 "for each state").
pub fn write_cct_section<W: Write>(
    w: &mut W,
    states: &[&ThreadProfilingState],
    total_trampoline_samples: u64,
) -> io::Result<()> {
    w.write_u32::<LittleEndian>(states.len() as u32)?;
    w.write_u64::<LittleEndian>(total_trampoline_samples)?;

    for state in states {
        for cct in state.all_ccts() {
            let dense_ids = cct.assign_dense_ids();
            let preorder = cct.preorder_with_parents(&dense_ids);

            // Spec §4.8: when a ctxt chain is present, the tree's top two
            // levels (the root and its direct children) are the thread's
            // bootstrap frames, owned by the host runtime rather than the
            // application, and are elided from the on-disk tree. Nodes
            // that were direct children of an elided depth-1 node are
            // rewritten to parent_dense_id 0 — the reader reattaches them
            // under the ctxt chain instead of an in-tree parent.
            let elide_bootstrap = !state.ctxt.is_empty();
            let mut elided_depth1: FxHashSet<u32> = FxHashSet::default();
            let mut to_write: Vec<(std::ptr::NonNull<crate::cct::Node>, u32)> =
                Vec::with_capacity(preorder.len());
            for (node_ptr, parent_dense_id) in &preorder {
                let node = unsafe { node_ptr.as_ref() };
                let my_dense_id = dense_ids[&node.disk_persistent_id()];
                if elide_bootstrap {
                    if my_dense_id == 1 {
                        continue; // root
                    }
                    if *parent_dense_id == 1 {
                        elided_depth1.insert(my_dense_id);
                        continue; // direct child of root
                    }
                }
                let effective_parent = if elided_depth1.contains(parent_dense_id) {
                    0
                } else {
                    *parent_dense_id
                };
                to_write.push((*node_ptr, effective_parent));
            }

            w.write_u32::<LittleEndian>(cct.epoch_id)?;
            w.write_u32::<LittleEndian>(to_write.len() as u32)?;
            w.write_u32::<LittleEndian>(state.ctxt.len() as u32)?;
            for entry in &state.ctxt {
                write_ctxt_entry(w, entry)?;
            }

            for (node_ptr, parent_dense_id) in &to_write {
                let node = unsafe { node_ptr.as_ref() };
                w.write_u32::<LittleEndian>(*parent_dense_id)?;
                w.write_u64::<LittleEndian>(node.ip)?;
                w.write_u64::<LittleEndian>(node.sp)?;
                write_as_info(w, &node.as_info(), node.lip())?;
                w.write_u32::<LittleEndian>(node.disk_persistent_id())?;
                let metrics = node.metrics();
                w.write_u32::<LittleEndian>(metrics.len() as u32)?;
                for m in metrics {
                    w.write_u64::<LittleEndian>(m.load(std::sync::atomic::Ordering::Relaxed))?;
                }
            }
        }
    }
    Ok(())
}

/// A parsed node, independent of the in-memory [`crate::cct::Node`]
/// representation — this is what a profile reader/viewer gets back.
#[derive(Debug, Clone)]
pub struct ReadNode {
    pub parent_dense_id: u32,
    pub ip: u64,
    pub sp: u64,
    pub as_info: AsInfo,
    pub lip: Option<Vec<u8>>,
    pub disk_persistent_id: u32,
    pub metrics: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct ReadState {
    pub epoch_id: u32,
    pub ctxt: Vec<ContextChainEntry>,
    pub nodes: Vec<ReadNode>,
}

pub fn read_cct_section<R: Read>(r: &mut R) -> io::Result<(Vec<ReadState>, u64)> {
    let state_count = r.read_u32::<LittleEndian>()?;
    let total_trampoline_samples = r.read_u64::<LittleEndian>()?;
    let mut states = Vec::with_capacity(state_count as usize);
    for _ in 0..state_count {
        let epoch_id = r.read_u32::<LittleEndian>()?;
        let num_nodes = r.read_u32::<LittleEndian>()?;
        let ctxt_len = r.read_u32::<LittleEndian>()?;
        let mut ctxt = Vec::with_capacity(ctxt_len as usize);
        for _ in 0..ctxt_len {
            ctxt.push(read_ctxt_entry(r)?);
        }
        let mut nodes = Vec::with_capacity(num_nodes as usize);
        for _ in 0..num_nodes {
            let parent_dense_id = r.read_u32::<LittleEndian>()?;
            let ip = r.read_u64::<LittleEndian>()?;
            let sp = r.read_u64::<LittleEndian>()?;
            let (as_info, lip) = read_as_info(r)?;
            let disk_persistent_id = r.read_u32::<LittleEndian>()?;
            let metric_count = r.read_u32::<LittleEndian>()?;
            let mut metrics = Vec::with_capacity(metric_count as usize);
            for _ in 0..metric_count {
                metrics.push(r.read_u64::<LittleEndian>()?);
            }
            nodes.push(ReadNode {
                parent_dense_id,
                ip,
                sp,
                as_info,
                lip: if lip.is_empty() { None } else { Some(lip) },
                disk_persistent_id,
                metrics,
            });
        }
        states.push(ReadState {
            epoch_id,
            ctxt,
            nodes,
        });
    }
    Ok((states, total_trampoline_samples))
}

/// `cstrace-{hostid:hex}-{pid:hex}[-{tid:dec}].csprof` (spec §4.8).
pub fn profile_filename(hostid: u64, pid: u32, thrid: Option<u32>) -> String {
    match thrid {
        Some(tid) => format!("cstrace-{hostid:x}-{pid:x}-{tid}.csprof"),
        None => format!("cstrace-{hostid:x}-{pid:x}.csprof"),
    }
}

/// Write a complete profile file at `dir/profile_filename(...)`, refusing
/// to overwrite an existing file (spec §4.8 "never silently overwrites an
/// existing trace").
pub fn write_profile_file(
    dir: &std::path::Path,
    hostid: u64,
    pid: u32,
    thrid: Option<u32>,
    table: &MetricDescriptorTable,
    newest_epoch: Option<&Epoch>,
    states: &[&ThreadProfilingState],
    total_trampoline_samples: u64,
) -> Result<std::path::PathBuf, crate::error::FatalError> {
    let path = dir.join(profile_filename(hostid, pid, thrid));
    if path.exists() {
        return Err(crate::error::FatalError::ProfileExists(path));
    }
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    let mut w = std::io::BufWriter::new(file);
    write_header(&mut w)?;
    write_metrics(&mut w, table)?;
    write_epochs(&mut w, newest_epoch)?;
    write_cct_section(&mut w, states, total_trampoline_samples)?;
    w.flush()?;
    log::debug!("wrote profile to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::EpochRegistry;
    use crate::ids::PersistentIdCounter;
    use crate::metric::MetricId;
    use crate::state::{PersistentIdentity, ThreadProfilingState};
    use csprof_unwind::{Frame, LushAgents};
    use std::io::Cursor;

    #[test]
    fn header_round_trips() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        read_header(&mut Cursor::new(buf)).unwrap();
    }

    #[test]
    fn metrics_round_trip() {
        let mut table = MetricDescriptorTable::new();
        table.set_max(1).unwrap();
        let id = table.new_metric().unwrap();
        table
            .set_info(id, "WALLCLOCK", MetricFlags::default(), 5000, MetricKind::Exclusive)
            .unwrap();

        let mut buf = Vec::new();
        write_metrics(&mut buf, &table).unwrap();
        let read = read_metrics(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].name, "WALLCLOCK");
        assert_eq!(read[0].period, 5000);
    }

    #[test]
    fn epochs_round_trip_in_chain_order() {
        let registry = EpochRegistry::new();
        registry.lock();
        registry.add_module("liba.so", 0x1000, 0x7f0000000000, 0x2000);
        let e1 = registry.new_epoch();
        registry.unlock();
        registry.lock();
        registry.add_module("libb.so", 0x1000, 0x7f0000100000, 0x1000);
        let e2 = registry.new_epoch();
        registry.unlock();
        let _ = e1;

        let mut buf = Vec::new();
        write_epochs(&mut buf, Some(e2.as_ref())).unwrap();
        let read = read_epochs(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].id, 1);
        assert_eq!(read[1].id, 2);
        assert_eq!(read[1].modules.len(), 2);
    }

    #[test]
    fn cct_section_round_trips_a_linear_stack() {
        let ids = PersistentIdCounter::new();
        let epoch_registry = EpochRegistry::new();
        epoch_registry.lock();
        let epoch = epoch_registry.new_epoch();
        epoch_registry.unlock();

        let pstate = PersistentIdentity {
            hostid: 0xdead,
            pid: 42,
            thrid: 1,
            ninit: 0,
        };
        let mut state =
            ThreadProfilingState::new(1, epoch, &ids, pstate, LushAgents::default(), Vec::new());

        let frames = vec![
            Frame::physical(0x400700, 0x7ffe0000),
            Frame::physical(0x400600, 0x7ffe0010),
        ];
        state.treenode =
            state
                .cct
                .insert_backtrace(state.treenode, &frames, MetricId(0), 3, &ids);

        let mut buf = Vec::new();
        write_cct_section(&mut buf, &[&state], 7).unwrap();
        let (states, total) = read_cct_section(&mut Cursor::new(buf)).unwrap();
        assert_eq!(total, 7);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].nodes.len(), 3, "root + foo + bar");
        let leaf = states[0]
            .nodes
            .iter()
            .find(|n| n.ip == 0x400700)
            .expect("leaf frame present");
        assert_eq!(leaf.metrics, vec![3]);
    }

    #[test]
    fn cct_section_elides_bootstrap_levels_when_ctxt_present() {
        let ids = PersistentIdCounter::new();
        let epoch_registry = EpochRegistry::new();
        epoch_registry.lock();
        let epoch = epoch_registry.new_epoch();
        epoch_registry.unlock();

        let pstate = PersistentIdentity {
            hostid: 0xdead,
            pid: 42,
            thrid: 1,
            ninit: 0,
        };
        let ctxt = vec![crate::cct::ContextChainEntry {
            ip: 0x300000,
            sp: 0x7ffe0100,
            as_info: csprof_unwind::AsInfo::PHYSICAL_ONLY,
            lip: None,
            persistent_id: 999,
        }];
        let mut state =
            ThreadProfilingState::new(1, epoch, &ids, pstate, LushAgents::default(), ctxt);

        // root -> thread_start (depth 1, bootstrap) -> main (depth 2, application)
        let frames = vec![
            Frame::physical(0x400600, 0x7ffe0010),
            Frame::physical(0x300100, 0x7ffe0000),
        ];
        state.treenode =
            state
                .cct
                .insert_backtrace(state.treenode, &frames, MetricId(0), 1, &ids);

        let mut buf = Vec::new();
        write_cct_section(&mut buf, &[&state], 0).unwrap();
        let (states, _) = read_cct_section(&mut Cursor::new(buf)).unwrap();
        assert_eq!(states[0].ctxt.len(), 1);
        assert_eq!(
            states[0].nodes.len(),
            1,
            "root and its direct child are elided, leaving only the application frame"
        );
        let only = &states[0].nodes[0];
        assert_eq!(only.ip, 0x400600);
        assert_eq!(
            only.parent_dense_id, 0,
            "reattaches via the ctxt chain, not an in-tree parent"
        );
    }

    #[test]
    fn filename_format_with_and_without_tid() {
        assert_eq!(profile_filename(0xABCD, 0x10, None), "cstrace-abcd-10.csprof");
        assert_eq!(
            profile_filename(0xABCD, 0x10, Some(7)),
            "cstrace-abcd-10-7.csprof"
        );
    }
}

//! Export reader: deserializes serialized program exports into the
//! program model.
//!
//! Two on-disk formats are supported. The current format is a magic tag
//! followed by one self-delimited record holding meta information, the
//! call graph, and all flow graphs. The legacy format is a fixed
//! little-endian header of absolute offsets followed by one record per
//! section. The reader tries the current format first and falls back to
//! legacy, mirroring how older exporters are still in circulation.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::call_graph::{CallGraph, FunctionVertex, Program, UNATTACHED};
use crate::error::{DiffError, DiffResult};
use crate::flow_graph::{Address, BasicBlock, FlowGraph, Instruction, InstructionCache};

/// Upper bound for any single record in an export file. Checked before
/// the record buffer is handed to the decoder.
pub const MAX_RECORD_SIZE: u64 = 500_000_000;

/// Magic tag opening a current-format export.
pub const EXPORT_MAGIC: [u8; 4] = *b"GDX2";

/// Per-binary meta information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRecord {
    pub input_binary: String,
    pub input_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallGraphVertexRecord {
    pub address: u64,
    pub name: String,
    pub demangled_name: Option<String>,
    pub library: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallGraphEdgeRecord {
    pub source: u32,
    pub target: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallGraphRecord {
    pub vertices: Vec<CallGraphVertexRecord>,
    pub edges: Vec<CallGraphEdgeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub call_target: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlockRecord {
    pub address: u64,
    pub instructions: Vec<InstructionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraphEdgeRecord {
    pub source: u32,
    pub target: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraphRecord {
    /// Entry-point address; also identifies the owning function.
    pub address: u64,
    pub basic_blocks: Vec<BasicBlockRecord>,
    pub edges: Vec<FlowGraphEdgeRecord>,
}

/// The complete current-format export record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFile {
    pub meta: MetaRecord,
    pub call_graph: CallGraphRecord,
    pub flow_graphs: Vec<FlowGraphRecord>,
}

/// Per-function summary for consumers that need counts without holding
/// flow graphs in memory.
#[derive(Debug, Clone, Serialize)]
pub struct FlowGraphInfo {
    pub address: Address,
    pub name: String,
    pub demangled_name: Option<String>,
    pub basic_block_count: u64,
    pub edge_count: u64,
    pub instruction_count: u64,
    /// Absolute file offset of the flow-graph record, when the format
    /// exposes one (legacy only).
    pub file_offset: u64,
}

/// Summary index keyed by entry-point address.
pub type FlowGraphInfos = BTreeMap<Address, FlowGraphInfo>;

/// Reads an export file, trying the current format first and falling
/// back to the legacy offset-table format.
pub fn read_export(path: &Path, cache: &InstructionCache) -> DiffResult<(Program, FlowGraphInfos)> {
    info!("reading {}", path.display());
    let bytes = fs::read(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => DiffError::NotFound {
            path: path.to_path_buf(),
        },
        _ => DiffError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;

    match decode_new_format(&bytes, path) {
        Ok(export) => {
            debug!("{}: current-format export", path.display());
            assemble(export, None, cache, path)
        }
        Err(DiffError::RecordTooLarge { path, size, limit }) => {
            Err(DiffError::RecordTooLarge { path, size, limit })
        }
        Err(err) => {
            debug!("{}: not current format ({err}), trying legacy", path.display());
            let (export, offsets) = decode_legacy(&bytes, path)?;
            assemble(export, Some(offsets), cache, path)
        }
    }
}

fn parse_error(path: &Path, phase: &'static str, message: impl ToString) -> DiffError {
    DiffError::Parse {
        path: path.to_path_buf(),
        phase,
        message: message.to_string(),
    }
}

fn decode_new_format(bytes: &[u8], path: &Path) -> DiffResult<ExportFile> {
    if bytes.len() < EXPORT_MAGIC.len() || bytes[..EXPORT_MAGIC.len()] != EXPORT_MAGIC {
        return Err(parse_error(path, "magic", "missing export magic"));
    }
    let record = &bytes[EXPORT_MAGIC.len()..];
    if record.len() as u64 >= MAX_RECORD_SIZE {
        return Err(DiffError::RecordTooLarge {
            path: path.to_path_buf(),
            size: record.len() as u64,
            limit: MAX_RECORD_SIZE,
        });
    }
    bincode::deserialize(record).map_err(|err| parse_error(path, "export record", err))
}

/// Extracts a legacy section, enforcing offset monotonicity and the
/// per-record size bound before touching the payload.
fn section<'a>(
    bytes: &'a [u8],
    start: u32,
    end: u32,
    path: &Path,
    phase: &'static str,
) -> DiffResult<&'a [u8]> {
    if end < start {
        return Err(parse_error(
            path,
            phase,
            format!("offset table not monotonic: {end} < {start}"),
        ));
    }
    let size = u64::from(end - start);
    if size >= MAX_RECORD_SIZE {
        return Err(DiffError::RecordTooLarge {
            path: path.to_path_buf(),
            size,
            limit: MAX_RECORD_SIZE,
        });
    }
    let (start, end) = (start as usize, end as usize);
    if end > bytes.len() {
        return Err(parse_error(
            path,
            phase,
            format!("offset {end} beyond end of file ({} bytes)", bytes.len()),
        ));
    }
    Ok(&bytes[start..end])
}

fn decode_legacy(bytes: &[u8], path: &Path) -> DiffResult<(ExportFile, Vec<u64>)> {
    let mut cursor = Cursor::new(bytes);
    let header = |err: io::Error| parse_error(path, "legacy header", err);
    let meta_offset = cursor.read_u32::<LittleEndian>().map_err(header)?;
    let call_graph_offset = cursor.read_u32::<LittleEndian>().map_err(header)?;
    let num_flow_graphs = cursor.read_u32::<LittleEndian>().map_err(header)?;

    // A sane header fits in the file; reject before allocating the table.
    let table_entries = u64::from(num_flow_graphs) + 1;
    if 12 + table_entries * 4 > bytes.len() as u64 {
        return Err(parse_error(
            path,
            "legacy header",
            format!("offset table of {table_entries} entries exceeds file size"),
        ));
    }
    let mut flow_graph_offsets = Vec::with_capacity(table_entries as usize);
    for _ in 0..table_entries {
        flow_graph_offsets.push(cursor.read_u32::<LittleEndian>().map_err(header)?);
    }

    let meta: MetaRecord =
        bincode::deserialize(section(bytes, meta_offset, call_graph_offset, path, "meta")?)
            .map_err(|err| parse_error(path, "meta", err))?;
    let call_graph: CallGraphRecord = bincode::deserialize(section(
        bytes,
        call_graph_offset,
        flow_graph_offsets[0],
        path,
        "call graph",
    )?)
    .map_err(|err| parse_error(path, "call graph", err))?;

    let mut flow_graphs = Vec::with_capacity(num_flow_graphs as usize);
    let mut offsets = Vec::with_capacity(num_flow_graphs as usize);
    for i in 0..num_flow_graphs as usize {
        // The +1 index is safe: the table carries a trailing sentinel.
        let raw = section(
            bytes,
            flow_graph_offsets[i],
            flow_graph_offsets[i + 1],
            path,
            "flow graph",
        )?;
        let record: FlowGraphRecord =
            bincode::deserialize(raw).map_err(|err| parse_error(path, "flow graph", err))?;
        offsets.push(u64::from(flow_graph_offsets[i]));
        flow_graphs.push(record);
    }

    Ok((
        ExportFile {
            meta,
            call_graph,
            flow_graphs,
        },
        offsets,
    ))
}

/// Builds the program model from decoded records, interning instruction
/// bytes through the shared cache and synthesizing empty flow graphs for
/// every function the export did not cover.
fn assemble(
    export: ExportFile,
    file_offsets: Option<Vec<u64>>,
    cache: &InstructionCache,
    path: &Path,
) -> DiffResult<(Program, FlowGraphInfos)> {
    let vertex_count = export.call_graph.vertices.len();
    for edge in &export.call_graph.edges {
        if edge.source as usize >= vertex_count || edge.target as usize >= vertex_count {
            return Err(parse_error(
                path,
                "call graph",
                format!("edge {}->{} out of range", edge.source, edge.target),
            ));
        }
    }

    let vertices: Vec<FunctionVertex> = export
        .call_graph
        .vertices
        .into_iter()
        .map(|v| FunctionVertex {
            address: v.address,
            name: v.name,
            demangled_name: v.demangled_name,
            library: v.library,
            stub: false,
            flow_graph: UNATTACHED,
        })
        .collect();
    let edges: Vec<(usize, usize)> = export
        .call_graph
        .edges
        .iter()
        .map(|e| (e.source as usize, e.target as usize))
        .collect();
    let mut call_graph = CallGraph::new(
        export.meta.input_binary,
        export.meta.input_hash,
        vertices,
        &edges,
    );

    let mut flow_graphs = Vec::new();
    let mut infos = FlowGraphInfos::new();
    for (i, record) in export.flow_graphs.into_iter().enumerate() {
        if record.basic_blocks.is_empty() {
            warn!("skipping empty flow graph at {:#x}", record.address);
            continue;
        }
        let block_count = record.basic_blocks.len();
        for edge in &record.edges {
            if edge.source as usize >= block_count || edge.target as usize >= block_count {
                return Err(parse_error(
                    path,
                    "flow graph",
                    format!(
                        "basic block edge {}->{} out of range at {:#x}",
                        edge.source, edge.target, record.address
                    ),
                ));
            }
        }
        let Some(vertex) = call_graph.vertex_at(record.address) else {
            warn!(
                "no call graph vertex for flow graph at {:#x}, skipping",
                record.address
            );
            continue;
        };
        if call_graph.vertex(vertex).flow_graph != UNATTACHED {
            warn!("duplicate flow graph at {:#x}, skipping", record.address);
            continue;
        }

        let blocks: Vec<BasicBlock> = record
            .basic_blocks
            .into_iter()
            .map(|b| {
                let instructions = b
                    .instructions
                    .into_iter()
                    .map(|instruction| {
                        let (bytes, pattern_hash) = cache.intern(&instruction.bytes);
                        Instruction {
                            address: instruction.address,
                            bytes,
                            pattern_hash,
                            call_target: instruction.call_target,
                        }
                    })
                    .collect();
                BasicBlock::new(b.address, instructions)
            })
            .collect();
        let edges: Vec<(usize, usize)> = record
            .edges
            .iter()
            .map(|e| (e.source as usize, e.target as usize))
            .collect();

        let function = call_graph.vertex(vertex);
        let flow_graph = FlowGraph::new(
            record.address,
            function.name.clone(),
            function.demangled_name.clone(),
            function.library,
            vertex,
            blocks,
            &edges,
        );

        infos.insert(
            record.address,
            FlowGraphInfo {
                address: record.address,
                name: flow_graph.name().to_owned(),
                demangled_name: flow_graph.demangled_name().map(str::to_owned),
                basic_block_count: flow_graph.basic_block_count() as u64,
                edge_count: flow_graph.edge_count() as u64,
                instruction_count: flow_graph.instruction_count() as u64,
                file_offset: file_offsets
                    .as_ref()
                    .and_then(|offsets| offsets.get(i))
                    .copied()
                    .unwrap_or(0),
            },
        );

        call_graph.vertex_mut(vertex).flow_graph = flow_graphs.len();
        flow_graphs.push(flow_graph);
    }

    // Functions the export carries no body for, typically imports. Each
    // gets an empty flow graph so that every vertex owns one.
    let unattached: Vec<_> = call_graph
        .vertices()
        .filter(|&v| call_graph.vertex(v).flow_graph == UNATTACHED)
        .collect();
    for vertex in unattached {
        let function = call_graph.vertex(vertex);
        let stub = FlowGraph::empty(
            function.address,
            function.name.clone(),
            function.demangled_name.clone(),
            vertex,
        );
        let function = call_graph.vertex_mut(vertex);
        function.stub = true;
        function.library = true;
        function.flow_graph = flow_graphs.len();
        flow_graphs.push(stub);
    }

    debug!(
        "{}: {} functions, {} flow graphs from export, {} interned patterns",
        path.display(),
        call_graph.vertex_count(),
        infos.len(),
        cache.len()
    );
    Ok((
        Program {
            call_graph,
            flow_graphs,
        },
        infos,
    ))
}

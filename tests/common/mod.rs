//! Shared fixtures: small synthetic programs and export-file writers for
//! both supported formats.
#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use graphdiff::reader::{
    BasicBlockRecord, CallGraphEdgeRecord, CallGraphRecord, CallGraphVertexRecord, ExportFile,
    FlowGraphEdgeRecord, FlowGraphRecord, InstructionRecord, MetaRecord, EXPORT_MAGIC,
};

pub fn instr(address: u64, bytes: &[u8]) -> InstructionRecord {
    InstructionRecord {
        address,
        bytes: bytes.to_vec(),
        call_target: None,
    }
}

pub fn call(address: u64, bytes: &[u8], target: u64) -> InstructionRecord {
    InstructionRecord {
        address,
        bytes: bytes.to_vec(),
        call_target: Some(target),
    }
}

pub fn block(address: u64, instructions: Vec<InstructionRecord>) -> BasicBlockRecord {
    BasicBlockRecord {
        address,
        instructions,
    }
}

pub fn flow_graph(
    address: u64,
    basic_blocks: Vec<BasicBlockRecord>,
    edges: &[(u32, u32)],
) -> FlowGraphRecord {
    FlowGraphRecord {
        address,
        basic_blocks,
        edges: edges
            .iter()
            .map(|&(source, target)| FlowGraphEdgeRecord { source, target })
            .collect(),
    }
}

pub fn vertex(address: u64, name: &str) -> CallGraphVertexRecord {
    CallGraphVertexRecord {
        address,
        name: name.to_owned(),
        demangled_name: None,
        library: false,
    }
}

pub fn call_graph(
    vertices: Vec<CallGraphVertexRecord>,
    edges: &[(u32, u32)],
) -> CallGraphRecord {
    CallGraphRecord {
        vertices,
        edges: edges
            .iter()
            .map(|&(source, target)| CallGraphEdgeRecord { source, target })
            .collect(),
    }
}

/// A small but structurally interesting program: `main` with a diamond,
/// a two-block `helper`, a single-block `leaf`, and an imported function
/// without a body that the reader must turn into a stub.
pub fn sample_export() -> ExportFile {
    let main = flow_graph(
        0x1000,
        vec![
            block(
                0x1000,
                vec![
                    instr(0x1000, &[0x55]),
                    instr(0x1001, &[0x48, 0x83, 0xec, 0x20]),
                    call(0x1005, &[0xe8, 0xf6, 0x0f, 0x00, 0x00], 0x2000),
                ],
            ),
            block(
                0x1010,
                vec![instr(0x1010, &[0x85, 0xc0]), instr(0x1012, &[0x74, 0x08])],
            ),
            block(
                0x1020,
                vec![
                    instr(0x1020, &[0xbf, 0x01, 0x00, 0x00, 0x00]),
                    call(0x1025, &[0xe8, 0xd6, 0x1f, 0x00, 0x00], 0x3000),
                ],
            ),
            block(
                0x1030,
                vec![instr(0x1030, &[0xc9]), instr(0x1031, &[0xc3])],
            ),
        ],
        &[(0, 1), (1, 2), (1, 3), (2, 3)],
    );
    let helper = flow_graph(
        0x2000,
        vec![
            block(
                0x2000,
                vec![instr(0x2000, &[0x53]), instr(0x2001, &[0x89, 0xfb])],
            ),
            block(
                0x2010,
                vec![
                    instr(0x2010, &[0x01, 0xd8]),
                    call(0x2012, &[0xe8, 0xe9, 0x0f, 0x00, 0x00], 0x3000),
                    instr(0x2017, &[0x5b]),
                    instr(0x2018, &[0xc3]),
                ],
            ),
        ],
        &[(0, 1)],
    );
    let leaf = flow_graph(
        0x3000,
        vec![block(
            0x3000,
            vec![instr(0x3000, &[0x31, 0xc0]), instr(0x3002, &[0xc3])],
        )],
        &[],
    );

    ExportFile {
        meta: MetaRecord {
            input_binary: "sample.bin".to_owned(),
            input_hash: "0d4a1e".to_owned(),
        },
        call_graph: call_graph(
            vec![
                vertex(0x1000, "main"),
                vertex(0x2000, "helper"),
                vertex(0x3000, "leaf"),
                vertex(0x4000, "ext_read"),
            ],
            &[(0, 1), (0, 2), (0, 3), (1, 2)],
        ),
        flow_graphs: vec![main, helper, leaf],
    }
}

/// Writes a current-format export: magic tag plus one bincode record.
pub fn write_new_format(dir: &Path, name: &str, export: &ExportFile) -> PathBuf {
    let path = dir.join(name);
    let mut bytes = EXPORT_MAGIC.to_vec();
    bytes.extend(bincode::serialize(export).expect("serialize export"));
    fs::write(&path, bytes).expect("write export");
    path
}

/// Writes a legacy export: fixed little-endian offset header followed by
/// one bincode record per section.
pub fn write_legacy_format(dir: &Path, name: &str, export: &ExportFile) -> PathBuf {
    let path = dir.join(name);
    let meta = bincode::serialize(&export.meta).expect("serialize meta");
    let call_graph = bincode::serialize(&export.call_graph).expect("serialize call graph");
    let flow_graphs: Vec<Vec<u8>> = export
        .flow_graphs
        .iter()
        .map(|record| bincode::serialize(record).expect("serialize flow graph"))
        .collect();

    let header_len = 12 + 4 * (flow_graphs.len() as u32 + 1);
    let meta_offset = header_len;
    let call_graph_offset = meta_offset + meta.len() as u32;
    let mut offset = call_graph_offset + call_graph.len() as u32;
    let mut flow_graph_offsets = Vec::with_capacity(flow_graphs.len() + 1);
    for section in &flow_graphs {
        flow_graph_offsets.push(offset);
        offset += section.len() as u32;
    }
    flow_graph_offsets.push(offset);

    let mut bytes = Vec::new();
    bytes.write_u32::<LittleEndian>(meta_offset).unwrap();
    bytes.write_u32::<LittleEndian>(call_graph_offset).unwrap();
    bytes
        .write_u32::<LittleEndian>(flow_graphs.len() as u32)
        .unwrap();
    for offset in &flow_graph_offsets {
        bytes.write_u32::<LittleEndian>(*offset).unwrap();
    }
    bytes.write_all(&meta).unwrap();
    bytes.write_all(&call_graph).unwrap();
    for section in &flow_graphs {
        bytes.write_all(section).unwrap();
    }
    fs::write(&path, bytes).expect("write export");
    path
}

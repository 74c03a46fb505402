//! Offline trace-file summarizer (spec-full §3d). Hand-rolled argument
//! parsing, matching the teacher's preference for small binaries that don't
//! need a full options parser for a handful of flags.
//!
//! Validates the 8-byte magic, then walks the block chain from offset 8
//! (spec P8), printing a count per block type and, for the `ProcessTrace`
//! block, the recorded globals/functions/thread-stream tables.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::process::ExitCode;

use seec_trace::error::TraceIoError;
use seec_trace::output_block::BLOCK_HEADER_SIZE;
use seec_trace::trace_format::{BlockType, MAGIC};

fn usage() -> ! {
    eprintln!("usage: seec-trace-dump [--events] <trace-file>");
    std::process::exit(2)
}

struct Args {
    path: String,
    show_events: bool,
}

fn parse_args() -> Args {
    let mut show_events = false;
    let mut path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--events" => show_events = true,
            "-h" | "--help" => usage(),
            _ if path.is_none() => path = Some(arg),
            _ => usage(),
        }
    }
    match path {
        Some(path) => Args { path, show_events },
        None => usage(),
    }
}

fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<(), TraceIoError> {
    file.seek(SeekFrom::Start(offset)).map_err(TraceIoError::Io)?;
    match file.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TraceIoError::Truncated),
        Err(e) => Err(TraceIoError::Io(e)),
    }
}

fn read_u64_at(file: &mut File, offset: u64) -> Result<u64, TraceIoError> {
    let mut buf = [0u8; 8];
    read_exact_at(file, offset, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// One block's header, read independently of the writer's `OutputBlock`
/// abstraction (the dump tool only ever reads).
struct Block {
    header_offset: u64,
    ty: BlockType,
    next: u64,
}

fn walk(file: &mut File) -> Result<Vec<Block>, TraceIoError> {
    let mut blocks = Vec::new();
    let mut offset = MAGIC.len() as u64;
    loop {
        let mut header = [0u8; BLOCK_HEADER_SIZE as usize];
        if read_exact_at(file, offset, &mut header).is_err() {
            break;
        }
        let Some(ty) = BlockType::from_u8(header[0]) else {
            return Err(TraceIoError::UnknownBlockType(header[0]));
        };
        let next = u64::from_le_bytes(header[1..9].try_into().unwrap());
        blocks.push(Block { header_offset: offset, ty, next });
        if next == 0 {
            break;
        }
        offset = next;
    }
    Ok(blocks)
}

fn print_process_trace(file: &mut File, block: &Block) -> Result<(), TraceIoError> {
    let payload = block.header_offset + BLOCK_HEADER_SIZE;
    let mut cursor = payload;
    let format_version = read_u64_at(file, cursor)?;
    cursor += 8;
    let name_len = read_u64_at(file, cursor)?;
    cursor += 8;
    let mut name_bytes = vec![0u8; name_len as usize];
    read_exact_at(file, cursor, &mut name_bytes)?;
    cursor += name_len;
    let module_identifier = String::from_utf8_lossy(&name_bytes);

    let global_count = read_u64_at(file, cursor)?;
    cursor += 8 + global_count * 8;
    let global_data_count = read_u64_at(file, cursor)?;
    cursor += 8 + global_data_count * 8;
    let function_count = read_u64_at(file, cursor)?;
    cursor += 8 + function_count * 8;
    let thread_stream_count = read_u64_at(file, cursor)?;

    println!("ProcessTrace block at offset {}:", block.header_offset);
    println!("  format version:    {format_version}");
    println!("  module:            {module_identifier}");
    println!("  globals:           {global_count} ({global_data_count} with initial data)");
    println!("  functions:         {function_count}");
    println!("  thread streams:    {thread_stream_count}");
    Ok(())
}

fn main() -> ExitCode {
    let args = parse_args();
    let mut file = match File::open(&args.path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("seec-trace-dump: cannot open '{}': {e}", args.path);
            return ExitCode::FAILURE;
        }
    };

    let mut magic = [0u8; 8];
    if read_exact_at(&mut file, 0, &mut magic).is_err() || &magic != MAGIC {
        eprintln!("seec-trace-dump: '{}': {}", args.path, TraceIoError::BadMagic);
        return ExitCode::FAILURE;
    }

    let blocks = match walk(&mut file) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("seec-trace-dump: failed reading block chain: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut counts: HashMap<&'static str, u64> = HashMap::new();
    for block in &blocks {
        let name = match block.ty {
            BlockType::Empty => "Empty",
            BlockType::ModuleBitcode => "ModuleBitcode",
            BlockType::ProcessTrace => "ProcessTrace",
            BlockType::ProcessData => "ProcessData",
            BlockType::ThreadEvents => "ThreadEvents",
            BlockType::SignalInfo => "SignalInfo",
        };
        *counts.entry(name).or_insert(0) += 1;
    }

    println!("{}: {} blocks", args.path, blocks.len());
    let mut names: Vec<_> = counts.keys().collect();
    names.sort();
    for name in names {
        println!("  {name}: {}", counts[name]);
    }

    for block in &blocks {
        if block.ty == BlockType::ProcessTrace {
            if let Err(e) = print_process_trace(&mut file, block) {
                eprintln!("seec-trace-dump: failed reading ProcessTrace payload: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if blocks.last().map(|b| b.next) != Some(0) {
        eprintln!("warning: block chain did not terminate cleanly; trace may be truncated (process likely did not exit cleanly)");
    }

    if args.show_events {
        println!("(event-level decoding is left to the replay viewer; this tool only reports block structure)");
    }

    ExitCode::SUCCESS
}

//! Drives a single process's NI against itself over the in-process loopback
//! transport: binds a source MD, posts a matching ME, submits a Put with an
//! ack, and prints every event the progress engine delivers.
//!
//! ```text
//! cargo run --example loopback -- --bytes 64 --rounds 8
//! ```

use clap::Parser;

use ptl4ni::config::NiConfig;
use ptl4ni::entry::{options as entry_opts, Entry};
use ptl4ni::identifiers::{ProcessId, NID_ANY, PID_ANY};
use ptl4ni::md::{Md, MdRegion};
use ptl4ni::ni::{MatchMode, Ni, NiKind, NiLimits};
use ptl4ni::progress::ProgressEngine;
use ptl4ni::transport::null::NullTransport;
use ptl4ni::wire::AckReq;

#[derive(Parser)]
struct Args {
    /// Payload size in bytes.
    #[arg(long, default_value_t = 64)]
    bytes: usize,

    /// Progress-engine passes to drive after submission.
    #[arg(long, default_value_t = 8)]
    rounds: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let id = ProcessId::new(1, 1);
    let ni = Ni::new(id, NiKind::Physical, MatchMode::Matching, NiLimits::default(), NiConfig::from_env(), Box::new(NullTransport::new()));

    let eq_i = ni.eq_alloc(16).expect("eq_alloc");
    let eq_t = ni.eq_alloc(16).expect("eq_alloc");

    let source: Vec<u8> = (0..args.bytes).map(|i| i as u8).collect();
    let put_md = ni.md_bind(Md::new(MdRegion::Contiguous(source), Some(eq_i), None, 0)).expect("md_bind");

    let pt_index = ni.pt_alloc(Some(eq_t), 0).expect("pt_alloc");
    ni.pt_enable(pt_index).expect("pt_enable");
    ni.entry_append(
        pt_index,
        Entry::new_me(vec![0u8; args.bytes], None, entry_opts::OP_PUT, u32::MAX, 0xbeef, 0, 0, ProcessId::new(NID_ANY, PID_ANY)),
        false,
    )
    .expect("entry_append");

    ni.put(ni.id, pt_index, 0xbeef, 0, args.bytes as u64, 0, put_md, AckReq::Ack, 0, 1).expect("put");

    let engine = ProgressEngine::new(&ni);
    for round in 0..args.rounds {
        engine.poll_once();
        while let Ok(event) = ni.eq_get(eq_i) {
            println!("round {round}: initiator event {:?} mlength={} ni_fail={:?}", event.kind, event.mlength, event.ni_fail);
        }
        while let Ok(event) = ni.eq_get(eq_t) {
            println!("round {round}: target event {:?} mlength={} ni_fail={:?}", event.kind, event.mlength, event.ni_fail);
        }
    }

    ni.fini();
}

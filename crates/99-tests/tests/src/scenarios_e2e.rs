use anyhow::{Context, Result};
use readable::{ReadableStream, Realm, RealmConfig, StreamState};
use stream_scenarios::{
    drain, run_scenario, verify, verify_flood, verify_no_reentrant_pull, ScenarioKind,
    ScriptedSource, SharedStats, StatsSink, TestConfig,
};

use crate::support::{init_logging, Checked};

const FLOOD_CHUNKS: u32 = 64;

fn run_config(config: TestConfig) -> Result<()> {
    init_logging();
    let kind = config.scenario_kind().context("unknown scenario type")?;
    let producer = Realm::new(RealmConfig::new("producer"));
    let consumer = Realm::new(RealmConfig::new("consumer"));
    for reader_realm in [&producer, &consumer] {
        let run = run_scenario(&producer, reader_realm, kind).checked()?;
        verify(&run).checked()?;
    }
    Ok(())
}

#[test]
fn flood_scenario_end_to_end() -> Result<()> {
    run_config(TestConfig::flood(FLOOD_CHUNKS))
}

#[test]
fn burst_scenario_end_to_end() -> Result<()> {
    run_config(TestConfig::burst(8, 5))
}

#[test]
fn backpressure_scenario_end_to_end() -> Result<()> {
    run_config(TestConfig::backpressure(40, 4))
}

#[test]
fn failing_scenario_end_to_end() -> Result<()> {
    run_config(TestConfig::failing(6))
}

#[test]
fn teed_flood_reaches_both_branches() -> Result<()> {
    init_logging();
    let realm = Realm::default();
    let stats = SharedStats::default();
    let kind = ScenarioKind::Flood {
        chunk_count: FLOOD_CHUNKS,
    };
    let source = ScriptedSource::new(&realm, kind, stats.clone());
    let stream = ReadableStream::from_source(&realm, source, kind.strategy().checked()?);
    let (left, right) = stream.tee().checked()?;

    let left_reader = left.get_reader().checked()?;
    let right_reader = right.get_reader().checked()?;
    let left_report = drain(&left_reader).checked()?;
    let right_report = drain(&right_reader).checked()?;

    let snapshot = stats.snapshot();
    verify_flood(&left_report, &snapshot, FLOOD_CHUNKS).checked()?;
    verify_flood(&right_report, &snapshot, FLOOD_CHUNKS).checked()?;
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(left.state(), StreamState::Closed);
    assert_eq!(right.state(), StreamState::Closed);
    Ok(())
}

#[test]
fn teed_burst_never_reenters_pull() -> Result<()> {
    init_logging();
    let realm = Realm::default();
    let stats = SharedStats::default();
    let kind = ScenarioKind::Burst {
        bursts: 6,
        burst_size: 3,
    };
    let source = ScriptedSource::new(&realm, kind, stats.clone());
    let stream = ReadableStream::from_source(&realm, source, kind.strategy().checked()?);
    let (left, right) = stream.tee().checked()?;
    let left_reader = left.get_reader().checked()?;
    let right_reader = right.get_reader().checked()?;

    // Interleave the branches so both drive upstream reads.
    let mut left_chunks = 0;
    let mut right_chunks = 0;
    loop {
        let a = left_reader.read().checked()?;
        let b = right_reader.read().checked()?;
        realm.run_until_idle();
        let a = a.value().context("left read stalled")?;
        let b = b.value().context("right read stalled")?;
        assert_eq!(a, b, "branches diverged");
        if a.done {
            break;
        }
        left_chunks += 1;
        right_chunks += 1;
    }
    assert_eq!(left_chunks, 18);
    assert_eq!(right_chunks, 18);
    verify_no_reentrant_pull(&stats.snapshot()).checked()?;
    Ok(())
}

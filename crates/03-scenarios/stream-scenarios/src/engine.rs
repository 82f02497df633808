use log::debug;
use readable::{ReadableStream, Realm, StreamResult};

use crate::checks::{
    verify_backpressure, verify_burst, verify_failure, verify_flood, verify_no_reentrant_pull,
    CheckResult,
};
use crate::config::ScenarioKind;
use crate::drain::{drain, pump, DrainReport};
use crate::source::ScriptedSource;
use crate::stats::{ScenarioStats, SharedStats, StatsSink};

#[derive(Clone, Debug)]
pub struct ScenarioRun {
    pub kind: ScenarioKind,
    pub report: DrainReport,
    pub stats: ScenarioStats,
}

/// Builds a scripted stream in `realm`, lets the source fill its queue, then
/// drains it through a reader owned by `consumer`.
pub fn run_scenario(realm: &Realm, consumer: &Realm, kind: ScenarioKind) -> StreamResult<ScenarioRun> {
    let stats = SharedStats::default();
    let source = ScriptedSource::new(realm, kind, stats.clone());
    let stream = ReadableStream::from_source(realm, source, kind.strategy()?);
    let reader = stream.get_reader_in(consumer)?;
    pump(&reader);
    let report = drain(&reader)?;
    debug!(
        "scenario {kind:?}: {} chunks in {} reads",
        report.chunks.len(),
        report.reads
    );
    Ok(ScenarioRun {
        kind,
        report,
        stats: stats.snapshot(),
    })
}

pub fn verify(run: &ScenarioRun) -> CheckResult {
    let ScenarioRun {
        kind,
        report,
        stats,
    } = run;
    match *kind {
        ScenarioKind::Flood { chunk_count } => verify_flood(report, stats, chunk_count)?,
        ScenarioKind::Burst { bursts, burst_size } => {
            verify_burst(report, stats, bursts, burst_size)?
        }
        ScenarioKind::Backpressure {
            chunks,
            high_water_mark,
        } => verify_backpressure(report, stats, chunks, high_water_mark)?,
        ScenarioKind::Failing { after } => verify_failure(report, stats, after)?,
    }
    verify_no_reentrant_pull(stats)
}

use readable::ErrorName;

use crate::drain::DrainReport;
use crate::stats::ScenarioStats;
use crate::FAILURE_MESSAGE;

pub type CheckResult = Result<(), String>;

fn verify_sequence(report: &DrainReport, expected: u32) -> CheckResult {
    if report.stalled {
        return Err(format!("drain stalled after {} reads", report.reads));
    }
    let received = u32::try_from(report.chunks.len()).unwrap_or(u32::MAX);
    if received != expected {
        return Err(format!("received {received} chunks, expected {expected}"));
    }
    for (index, number) in report.numbers().into_iter().enumerate() {
        if number != Some(index as f64) {
            return Err(format!("chunk {index} out of order: {number:?}"));
        }
    }
    Ok(())
}

pub fn verify_flood(report: &DrainReport, stats: &ScenarioStats, expected: u32) -> CheckResult {
    verify_sequence(report, expected)?;
    if !report.done {
        return Err(format!("stream did not close: error={:?}", report.error));
    }
    if stats.produced != expected {
        return Err(format!(
            "source produced {} chunks, expected {expected}",
            stats.produced
        ));
    }
    Ok(())
}

pub fn verify_burst(
    report: &DrainReport,
    stats: &ScenarioStats,
    bursts: u32,
    burst_size: u32,
) -> CheckResult {
    verify_flood(report, stats, bursts.saturating_mul(burst_size))?;
    if stats.pulls < bursts {
        return Err(format!(
            "{bursts} bursts arrived in only {} pulls",
            stats.pulls
        ));
    }
    // One burst may land on top of a queue that is one short of the mark.
    if burst_size > 0 && stats.max_queued >= burst_size.saturating_mul(2) {
        return Err(format!(
            "queue reached {} entries with bursts of {burst_size}",
            stats.max_queued
        ));
    }
    Ok(())
}

pub fn verify_backpressure(
    report: &DrainReport,
    stats: &ScenarioStats,
    chunks: u32,
    high_water_mark: u32,
) -> CheckResult {
    verify_flood(report, stats, chunks)?;
    if stats.max_queued > high_water_mark {
        return Err(format!(
            "queue reached {} entries past high-water mark {high_water_mark}",
            stats.max_queued
        ));
    }
    if chunks > high_water_mark && high_water_mark > 0 && stats.backpressure_stops == 0 {
        return Err("producer never hit the high-water mark".to_string());
    }
    Ok(())
}

pub fn verify_failure(report: &DrainReport, stats: &ScenarioStats, after: u32) -> CheckResult {
    verify_sequence(report, after)?;
    if report.done {
        return Err("failing stream reported done".to_string());
    }
    let Some(error) = &report.error else {
        return Err("failing stream never rejected a read".to_string());
    };
    if error.error_name() != Some(ErrorName::Error) || error.error_message() != Some(FAILURE_MESSAGE)
    {
        return Err(format!("unexpected rejection: {error:?}"));
    }
    if stats.produced != after {
        return Err(format!("source produced {} chunks, expected {after}", stats.produced));
    }
    Ok(())
}

pub fn verify_no_reentrant_pull(stats: &ScenarioStats) -> CheckResult {
    if stats.overlapping_pulls != 0 {
        return Err(format!(
            "pull invoked {} times while a previous pull was pending",
            stats.overlapping_pulls
        ));
    }
    Ok(())
}

use anyhow::{Context, Result};
use readable::{ErrorName, Realm, RealmConfig, StreamState, Value};
use stream_scenarios::{drain, pump};

use crate::support::{init_logging, pushed, settle, Checked};

#[test]
fn branches_read_from_another_realm() -> Result<()> {
    init_logging();
    let producer = Realm::new(RealmConfig::new("producer"));
    let consumer = Realm::new(RealmConfig::new("consumer"));
    let (source, stream) = pushed(&producer);
    let (left, right) = stream.tee_with(true).checked()?;
    let left_reader = left.get_reader_in(&consumer).checked()?;
    let right_reader = right.get_reader_in(&consumer).checked()?;

    let record = Value::record(
        producer.domain(),
        vec![("seq".to_string(), Value::from(1)), ("body".to_string(), Value::from("x"))],
    );
    let controller = source.controller()?;
    controller.enqueue(record.clone()).checked()?;
    controller.close().checked()?;

    let left_report = drain(&left_reader).checked()?;
    let right_report = drain(&right_reader).checked()?;
    assert!(left_report.done && right_report.done);
    let from_left = left_report.chunks.first().context("left chunk")?;
    let from_right = right_report.chunks.first().context("right chunk")?;

    let left_target = from_left.as_object().context("left object")?.target();
    let right_target = from_right.as_object().context("right object")?.target();
    assert!(left_target.same(record.as_object().context("record")?));
    assert!(!right_target.same(left_target), "branch 2 holds a clone");
    assert!(from_right.home().context("home")?.same(consumer.domain()));
    Ok(())
}

#[test]
fn consumer_cancels_of_both_branches_merge_upstream() -> Result<()> {
    init_logging();
    let producer = Realm::new(RealmConfig::new("producer"));
    let consumer = Realm::new(RealmConfig::new("consumer"));
    let (source, stream) = pushed(&producer);
    let (left, right) = stream.tee().checked()?;
    let left_reader = left.get_reader_in(&consumer).checked()?;
    let right_reader = right.get_reader_in(&consumer).checked()?;

    let first = left_reader.cancel(Value::from("left done")).checked()?;
    pump(&left_reader);
    assert!(first.is_pending(), "waits for the other branch");
    assert!(source.reasons.borrow().is_empty());

    let second = right_reader
        .cancel(consumer.error(ErrorName::Error, "right done"))
        .checked()?;
    pump(&right_reader);
    assert_eq!(settle(&consumer, first)?, Ok(()));
    assert_eq!(settle(&consumer, second)?, Ok(()));

    let reasons = source.reasons.borrow();
    assert_eq!(reasons.len(), 1);
    let items = reasons[0].list_items().context("composite reason")?;
    assert_eq!(items[0], Value::from("left done"));
    assert_eq!(items[1].error_message(), Some("right done"));
    assert!(items[1].home().context("home")?.same(producer.domain()));
    assert_eq!(stream.state(), StreamState::Closed);
    Ok(())
}

#[test]
fn drained_tee_releases_every_slot() -> Result<()> {
    init_logging();
    let realm = Realm::default();
    {
        let (source, stream) = pushed(&realm);
        let (left, right) = stream.tee().checked()?;
        assert_eq!(realm.live_streams(), 3);
        let controller = source.controller()?;
        for n in 0..3 {
            controller.enqueue(n).checked()?;
        }
        controller.close().checked()?;

        for branch in [&left, &right] {
            let reader = branch.get_reader().checked()?;
            let report = drain(&reader).checked()?;
            assert_eq!(report.chunks.len(), 3);
        }
    }
    realm.run_until_idle();
    assert_eq!(realm.live_streams(), 0);
    Ok(())
}

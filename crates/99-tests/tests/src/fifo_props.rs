use proptest::prelude::*;
use readable::{QueuingStrategy, ReadableStream, Realm, Value};

use crate::support::Pusher;

#[derive(Clone, Debug)]
enum Step {
    Enqueue,
    Read,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![Just(Step::Enqueue), Just(Step::Read)]
}

proptest! {
    #[test]
    fn reads_settle_in_call_order(
        steps in proptest::collection::vec(step(), 1..64),
        high_water_mark in 0u32..8,
    ) {
        let realm = Realm::default();
        let source = std::rc::Rc::new(Pusher::default());
        let strategy = QueuingStrategy::count(f64::from(high_water_mark)).unwrap();
        let stream = ReadableStream::from_source(&realm, source.clone(), strategy);
        realm.run_until_idle();
        let controller = source.controller().unwrap();
        let reader = stream.get_reader().unwrap();

        let mut produced = 0;
        let mut reads = Vec::new();
        for step in &steps {
            match step {
                Step::Enqueue => {
                    controller.enqueue(produced).unwrap();
                    produced += 1;
                }
                Step::Read => reads.push(reader.read().unwrap()),
            }
            realm.run_until_idle();
        }
        controller.close().unwrap();
        realm.run_until_idle();

        let mut expected = 0;
        for read in reads {
            let result = read.value().unwrap();
            if expected < produced {
                prop_assert_eq!(result.value, Value::from(expected));
                prop_assert!(!result.done);
                expected += 1;
            } else {
                prop_assert!(result.done);
            }
        }
        let queued = usize::try_from(produced - expected).unwrap();
        prop_assert_eq!(controller.queued(), queued);
    }
}

use std::sync::mpsc;
use std::time::Duration;

use proptest::prelude::*;
use sync::RangeTask;

const START: u64 = 5;
const END: u64 = 10;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// Every height of the range at least once, in arbitrary order, with
/// arbitrary extra duplicates.
fn reports_with_duplicates() -> impl Strategy<Value = Vec<u64>> {
    (
        Just((START..=END).collect::<Vec<_>>()).prop_shuffle(),
        prop::collection::vec(START..=END, 0..12),
    )
        .prop_flat_map(|(order, extra)| {
            let mut reports = order;
            reports.extend(extra);
            Just(reports).prop_shuffle()
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_report_order_completes_exactly_once(reports in reports_with_duplicates()) {
        let rt = runtime();
        let _guard = rt.enter();
        let task = RangeTask::new(Duration::from_secs(60));
        let (tx, rx) = mpsc::channel();

        task.start(START, END, move || {
            let _ = tx.send(());
        })
        .unwrap();
        for height in &reports {
            task.done(*height);
        }

        prop_assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        prop_assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        prop_assert!(!task.in_progress());
        prop_assert!(task.snapshot().complete);
    }

    #[test]
    fn cursor_stops_at_first_missing_height(
        reports in prop::collection::vec(START..=END, 0..20)
    ) {
        let rt = runtime();
        let _guard = rt.enter();
        let task = RangeTask::new(Duration::from_secs(60));
        task.start(START, END, || {}).unwrap();

        for height in &reports {
            task.done(*height);
        }

        let first_missing = (START..=END).find(|h| !reports.contains(h));
        let snapshot = task.snapshot();
        match first_missing {
            Some(height) => {
                prop_assert!(snapshot.running);
                prop_assert_eq!(snapshot.start, height);
                let ahead = (height + 1..=END).filter(|h| reports.contains(h)).count();
                prop_assert_eq!(snapshot.pending, ahead);
            }
            None => prop_assert!(snapshot.complete),
        }
    }
}

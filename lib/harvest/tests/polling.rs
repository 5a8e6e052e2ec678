use std::time::Duration;

use harvest::{
    DirectoryHarvester, Error, GrowingFileHarvester, Harvest, Poller, RangeError, Snapshot, Span,
    UnprocessedRanges,
};
use tokio::sync::{mpsc, oneshot};

const INTERVAL: Duration = Duration::from_millis(10);

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_harvester_driven_by_poller() {
    let dir = tempfile::tempdir().unwrap();
    testify::fs::write(&dir.path().join("unit_10.dat"), "10\n");
    testify::fs::write(&dir.path().join("unit_2.dat"), "2\n");
    testify::fs::write(&dir.path().join("ignored.log"), "x\n");

    let mut harvester = DirectoryHarvester::new(dir.path(), "unit_*.dat", Duration::ZERO).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let poller = Poller::new(
        "units",
        INTERVAL,
        move || harvester.poll(&Snapshot::new()),
        move |harvest: Harvest| {
            let names = harvest
                .new
                .into_iter()
                .map(|(name, _)| name)
                .collect::<Vec<_>>();
            let _ = tx.send(names);
            Ok(())
        },
        |err: Error| panic!("unexpected error {err}"),
    );
    let handle = poller.start();

    assert_eq!(recv(&mut rx).await, vec!["unit_2.dat", "unit_10.dat"]);

    testify::fs::write(&dir.path().join("unit_3.dat"), "3\n");
    assert_eq!(recv(&mut rx).await, vec!["unit_3.dat"]);

    handle.shutdown();
    handle.join().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poller_reports_scan_error_once() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("instrument");
    std::fs::create_dir(&dir).unwrap();

    let mut harvester = DirectoryHarvester::new(&dir, "*", Duration::ZERO).unwrap();
    let (tx, rx) = oneshot::channel();
    let poller = Poller::new(
        "vanishing",
        INTERVAL,
        move || harvester.poll(&Snapshot::new()),
        |_: Harvest| Ok(()),
        move |err: Error| {
            let _ = tx.send(err);
        },
    );
    let handle = poller.start();

    std::fs::remove_dir(&dir).unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("timed out")
        .unwrap();
    assert!(matches!(err, Error::Scan { .. }), "{err}");

    handle.join().await;
}

#[test]
fn growing_file_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adcp.log");
    testify::fs::write(&path, "abc");

    let mut harvester = GrowingFileHarvester::new(dir.path(), "adcp.log", Duration::ZERO);
    let mut ranges = UnprocessedRanges::new();
    let mut last_size = 0;

    let (_, state) = harvester.poll().unwrap().unwrap();
    ranges.extend(last_size, state.size).unwrap();
    last_size = state.size;
    // a parser only took the first two bytes
    ranges.consume(0, 2).unwrap();
    assert_eq!(ranges.spans(), &[Span { start: 2, end: 3 }]);

    testify::fs::append(&path, "defgh");
    let (_, state) = harvester.poll().unwrap().unwrap();
    ranges.extend(last_size, state.size).unwrap();
    last_size = state.size;
    assert_eq!(ranges.spans(), &[Span { start: 2, end: 8 }]);
    assert_eq!(ranges.pending(), 6);

    ranges.consume(4, 6).unwrap();
    assert_eq!(
        ranges.spans(),
        &[Span { start: 2, end: 4 }, Span { start: 6, end: 8 }]
    );

    testify::fs::write(&path, "x");
    let (_, state) = harvester.poll().unwrap().unwrap();
    let err = ranges.extend(last_size, state.size).unwrap_err();
    assert_eq!(err, RangeError::Regression { last: 8, next: 1 });
}

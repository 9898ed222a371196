//! End-to-end lifecycle of a list file: append a mixed workload,
//! reopen, read back, and surface corruption.

use monsoon_history::{Error, Tsdata};
use monsoon_model::{
    GroupName, Histogram, MetricMap, MetricName, MetricValue, SimpleGroup, Tags, TimePoint,
    TimeSeries,
};
use monsoon_txfile::io::WriteAt;

fn sample_series(at: i64, shard: i64) -> TimeSeries {
    let mut hist = Histogram::new();
    hist.add(0.0, 10.0, 4.0);
    hist.add(10.0, 100.0, 1.0);

    let tags = Tags::from_iter([
        ("host".to_string(), MetricValue::from("web-1")),
        ("shard".to_string(), MetricValue::Int(shard)),
    ]);
    let mut ts = TimeSeries::new(TimePoint::from_millis(at));
    ts.insert(
        GroupName::new(SimpleGroup::new(["com", "acme", "web"]), tags),
        MetricMap::from_iter([
            (MetricName::new(["requests"]), MetricValue::Int(at * 10)),
            (MetricName::new(["load"]), MetricValue::Flt(0.75)),
            (MetricName::new(["up"]), MetricValue::Bool(true)),
            (MetricName::new(["state"]), MetricValue::from("serving")),
            (MetricName::new(["latency"]), MetricValue::Histogram(hist)),
            (MetricName::new(["marker"]), MetricValue::Empty),
        ]),
    );
    ts
}

#[test]
fn append_reopen_read_back() {
    let _ = env_logger::builder().is_test(true).try_init();
    let raw = tempfile::tempfile().unwrap();
    let mut data =
        Tsdata::new_list_file(raw.try_clone().unwrap(), TimePoint::from_millis(0)).unwrap();

    let expect: Vec<TimeSeries> = (1..=20).map(|i| sample_series(i * 100, i)).collect();
    for ts in &expect {
        data.push_back(ts).unwrap();
    }
    assert!(data.is_sorted());
    assert_eq!(data.time().1, TimePoint::from_millis(2000));
    assert_eq!(data.read_all().unwrap(), expect);
    drop(data);

    let reopened = Tsdata::open(raw).unwrap();
    assert_eq!(reopened.version(), (2, 0));
    assert_eq!(reopened.read_all().unwrap(), expect);
}

#[test]
fn shared_names_reuse_the_dictionary() {
    // Appending the same group over and over must only ship one
    // dictionary delta; later records carry none.
    let raw = tempfile::tempfile().unwrap();
    let mut data =
        Tsdata::new_list_file(raw.try_clone().unwrap(), TimePoint::from_millis(0)).unwrap();

    for i in 1..=10 {
        data.push_back(&sample_series(i * 100, 1)).unwrap();
    }
    let size_after_ten = std::fs::File::metadata(&raw).unwrap().len();

    // A fresh handle decodes everything through the accumulated
    // dictionary chain.
    let reopened = Tsdata::open(raw).unwrap();
    let all = reopened.read_all().unwrap();
    assert_eq!(all.len(), 10);
    assert!(size_after_ten > 0);
}

#[test]
fn corrupt_record_surfaces_crc_mismatch() {
    let raw = tempfile::tempfile().unwrap();
    let mut data =
        Tsdata::new_list_file(raw.try_clone().unwrap(), TimePoint::from_millis(0)).unwrap();
    data.push_back(&sample_series(100, 1)).unwrap();
    data.push_back(&sample_series(200, 1)).unwrap();
    drop(data);

    // Flip a byte in the payload area past the header.
    let mut byte = [0u8; 1];
    monsoon_txfile::io::ReadAt::read_exact_at(&raw, 100, &mut byte).unwrap();
    raw.write_all_at(100, &[!byte[0]]).unwrap();

    let reopened = Tsdata::open(raw).unwrap();
    let err = reopened.read_all().unwrap_err();
    assert!(
        matches!(
            err,
            Error::CrcMismatch | Error::BadPadding | Error::EndOfStream | Error::DataRemaining
        ),
        "unexpected error: {err:?}",
    );
}

#[test]
fn header_corruption_fails_open() {
    let raw = tempfile::tempfile().unwrap();
    let data = Tsdata::new_list_file(raw.try_clone().unwrap(), TimePoint::from_millis(0)).unwrap();
    drop(data);

    raw.write_all_at(20, &[0xaa]).unwrap();
    assert!(matches!(Tsdata::open(raw), Err(Error::CrcMismatch)));
}

//! Delta-encoded timestamp vectors: an `i64` base in milliseconds
//! followed by `i32` deltas between consecutive entries.

use monsoon_model::{TimePoint, TimePointDelta};

use crate::xdr::{XdrRead, XdrWrite};
use crate::{Error, Result};

pub fn decode_timestamp_delta(reader: &mut impl XdrRead) -> Result<Vec<TimePoint>> {
    let mut out = vec![TimePoint::from_millis(reader.get_i64()?)];
    reader.accept_collection(
        |r| r.get_i32(),
        |delta| {
            let last = *out.last().unwrap();
            out.push(last + TimePointDelta::from_millis(delta.into()));
        },
    )?;
    Ok(out)
}

/// Encode `timestamps`, which must be non-empty. Fails with
/// [`Error::EncodingRange`] when a gap between consecutive entries
/// does not fit a signed 32-bit millisecond count.
pub fn encode_timestamp_delta(
    writer: &mut impl XdrWrite,
    timestamps: &[TimePoint],
) -> Result<()> {
    let Some(&first) = timestamps.first() else {
        return Err(Error::EncodingRange("empty timestamp collection"));
    };
    writer.put_i64(first.millis_since_epoch())?;

    // Deltas are checked before anything past the base is written.
    let mut deltas = Vec::with_capacity(timestamps.len() - 1);
    for pair in timestamps.windows(2) {
        let delta = (pair[1] - pair[0]).millis();
        deltas.push(
            i32::try_from(delta)
                .map_err(|_| Error::EncodingRange("time between successive timestamps too large"))?,
        );
    }
    writer.put_collection(deltas.into_iter(), |w, d| w.put_i32(d))
}

//! On-disk framing of persisted series.
//!
//! A data file starts with [`MAGIC`] and is followed by records of
//! `key length (u16) | key | point count (u16) | points | crc32`, all
//! big-endian. The CRC-32 covers every preceding byte of its record.

use std::io::{self, Write};

use crate::{MetricKey, Point, POINT_SIZE};

pub const MAGIC: [u8; 4] = *b"PFS1";
pub const MAX_KEY_LEN: usize = u16::MAX as usize;
pub const MAX_RECORD_POINTS: usize = u16::MAX as usize;

pub fn encode_key(wtr: &mut impl Write, key: &MetricKey) -> io::Result<()> {
    let len = u16::try_from(key.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("series key of {} bytes exceeds {MAX_KEY_LEN}", key.len()),
        )
    })?;
    wtr.write_all(&len.to_be_bytes())?;
    wtr.write_all(key.as_bytes())
}
pub fn encode_point(point: Point) -> [u8; POINT_SIZE] {
    let mut buf = [0; POINT_SIZE];
    buf[..8].copy_from_slice(&point.time.to_be_bytes());
    buf[8..].copy_from_slice(&point.value.to_be_bytes());
    buf
}
pub fn decode_point(buf: [u8; POINT_SIZE]) -> Point {
    let mut time = [0; 8];
    time.copy_from_slice(&buf[..8]);
    let mut value = [0; 8];
    value.copy_from_slice(&buf[8..]);
    Point {
        time: i64::from_be_bytes(time),
        value: f64::from_be_bytes(value),
    }
}

/// Checksums everything written through it.
struct Checksummed<'a, W> {
    wtr: &'a mut W,
    hasher: crc32fast::Hasher,
}
impl<W: Write> Write for Checksummed<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.wtr.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.wtr.flush()
    }
}

/// Writes `points` of one series, splitting them over as many records as
/// the point count field allows.
pub fn encode_series(wtr: &mut impl Write, key: &MetricKey, points: &[Point]) -> io::Result<()> {
    for chunk in points.chunks(MAX_RECORD_POINTS) {
        let mut record = Checksummed {
            wtr: &mut *wtr,
            hasher: crc32fast::Hasher::new(),
        };
        encode_key(&mut record, key)?;
        let count = u16::try_from(chunk.len()).map_err(|_| io::ErrorKind::InvalidInput)?;
        record.write_all(&count.to_be_bytes())?;
        for point in chunk {
            record.write_all(&encode_point(*point))?;
        }
        let crc = record.hasher.finalize();
        wtr.write_all(&crc.to_be_bytes())?;
    }
    Ok(())
}

/// Reads the next record into `key` and `points`.
///
/// Returns `false` at a clean end of input. A record cut short is reported as
/// [`io::ErrorKind::UnexpectedEof`], a checksum mismatch as
/// [`io::ErrorKind::InvalidData`].
pub async fn decode_record<R>(
    rdr: &mut R,
    key: &mut MetricKey,
    points: &mut Vec<Point>,
) -> io::Result<bool>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut len = [0; 2];
    if rdr.read(&mut len[..1]).await? == 0 {
        return Ok(false);
    }
    rdr.read_exact(&mut len[1..]).await?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len);
    let len = u16::from_be_bytes(len);
    let mut buf = std::mem::take(key).into_bytes();
    buf.clear();
    buf.resize(usize::from(len), 0);
    rdr.read_exact(&mut buf).await?;
    hasher.update(&buf);

    let mut count = [0; 2];
    rdr.read_exact(&mut count).await?;
    hasher.update(&count);
    points.clear();
    for _ in 0..u16::from_be_bytes(count) {
        let mut point = [0; POINT_SIZE];
        rdr.read_exact(&mut point).await?;
        hasher.update(&point);
        points.push(decode_point(point));
    }
    if rdr.read_u32().await? != hasher.finalize() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "record checksum mismatch",
        ));
    }
    *key = String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_layout() {
        let mut buf = vec![];
        let key = MetricKey::from("up");
        encode_series(&mut buf, &key, &[Point { time: 1, value: 0.5 }]).unwrap();
        assert_eq!(&buf[..2], &[0, 2]);
        assert_eq!(&buf[2..4], b"up");
        assert_eq!(&buf[4..6], &[0, 1]);
        assert_eq!(buf.len(), 6 + POINT_SIZE + 4);
        let crc = crc32fast::hash(&buf[..6 + POINT_SIZE]);
        assert_eq!(&buf[6 + POINT_SIZE..], &crc.to_be_bytes());

        let mut rdr = &buf[..];
        let mut decoded_key = MetricKey::new();
        let mut decoded = vec![];
        assert!(decode_record(&mut rdr, &mut decoded_key, &mut decoded)
            .await
            .unwrap());
        assert_eq!(decoded_key, "up");
        assert_eq!(decoded, vec![Point { time: 1, value: 0.5 }]);
        assert!(!decode_record(&mut rdr, &mut decoded_key, &mut decoded)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_large_series_spans_records() {
        let points: Vec<_> = (0..MAX_RECORD_POINTS as i64 + 10)
            .map(|time| Point {
                time,
                value: time as f64,
            })
            .collect();
        let mut buf = vec![];
        encode_series(&mut buf, &"big".to_string(), &points).unwrap();

        let mut rdr = &buf[..];
        let mut key = MetricKey::new();
        let mut decoded = vec![];
        let mut records = 0;
        let mut chunk = vec![];
        while decode_record(&mut rdr, &mut key, &mut chunk).await.unwrap() {
            records += 1;
            assert_eq!(key, "big");
            decoded.extend_from_slice(&chunk);
        }
        assert_eq!(records, 2);
        assert_eq!(decoded, points);
    }

    #[tokio::test]
    async fn test_truncated_record() {
        let mut buf = vec![];
        let points = [Point { time: 7, value: 1.0 }, Point { time: 8, value: 2.0 }];
        encode_series(&mut buf, &"a".to_string(), &points).unwrap();
        buf.truncate(buf.len() - 3);

        let mut rdr = &buf[..];
        let mut key = MetricKey::new();
        let mut decoded = vec![];
        let err = decode_record(&mut rdr, &mut key, &mut decoded)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let mut buf = vec![];
        encode_series(&mut buf, &"a".to_string(), &[Point { time: 7, value: 1.0 }]).unwrap();
        buf[5] ^= 1;

        let mut rdr = &buf[..];
        let mut key = MetricKey::new();
        let mut decoded = vec![];
        let err = decode_record(&mut rdr, &mut key, &mut decoded)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_oversized_key() {
        let key = "k".repeat(MAX_KEY_LEN + 1);
        let err = encode_key(&mut Vec::new(), &key).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}

//! Versioned persisted layout of the address database
//!
//! ```text
//! version: u8                      outer container version (current 1)
//! count:   CompactSize             number of records
//! record[count]                    each prefixed by its own version (0..=6)
//! banned:  CompactSize + (endpoint, i64)*
//! ```
//!
//! Outer version 0 stores endpoints in the legacy 16 byte format, version 1
//! and later in the extended format. Record fields are described by
//! [`TRIED_LAYOUT`] so that reading and writing share one version table.

use std::collections::BTreeMap;
use std::ops::Range;

use super::codec::{AddrFormat, CodecError, Reader, Writer};
use super::record::AddrRecord;
use super::stat::ReliabilityStat;
use crate::types::{Endpoint, ServiceFlags};

/// Current outer container version
pub const DB_VERSION: u8 = 1;

/// First outer version storing endpoints in the extended format
pub const FIRST_ADDRV2_VERSION: u8 = 1;

/// Current per-record version
pub const RECORD_VERSION: u8 = 6;

/// Versions a field has been part of the layout for
const ALWAYS: Range<u8> = 0..u8::MAX;

/// One field of a tried record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    OurLastTry,
    /// Retired retry deadline, read and discarded
    IgnoreTill,
    Stat2H,
    Stat8H,
    Stat1D,
    Stat1W,
    Stat1M,
    Total,
    Success,
    ClientVersion,
    ClientSubVersion,
    Blocks,
    OurLastSuccess,
    LastAddressRequest,
    CheckpointVerified,
}

/// Fields following the `tried` flag, in stream order, with the record
/// versions that carry them
const TRIED_LAYOUT: &[(Field, Range<u8>)] = &[
    (Field::OurLastTry, ALWAYS),
    (Field::IgnoreTill, 0..6),
    (Field::Stat2H, ALWAYS),
    (Field::Stat8H, ALWAYS),
    (Field::Stat1D, ALWAYS),
    (Field::Stat1W, ALWAYS),
    (Field::Stat1M, 1..u8::MAX),
    (Field::Total, ALWAYS),
    (Field::Success, ALWAYS),
    (Field::ClientVersion, ALWAYS),
    (Field::ClientSubVersion, 2..u8::MAX),
    (Field::Blocks, 3..u8::MAX),
    (Field::OurLastSuccess, 4..u8::MAX),
    (Field::LastAddressRequest, 5..u8::MAX),
    (Field::CheckpointVerified, 6..u8::MAX),
];

fn addr_format(db_version: u8) -> AddrFormat {
    if db_version >= FIRST_ADDRV2_VERSION {
        AddrFormat::V2
    } else {
        AddrFormat::Legacy
    }
}

fn read_stat(r: &mut Reader<'_>) -> Result<ReliabilityStat, CodecError> {
    Ok(ReliabilityStat {
        weight: r.read_f32()?,
        count: r.read_f32()?,
        reliability: r.read_f32()?,
    })
}

fn write_stat(w: &mut Writer, stat: &ReliabilityStat) {
    w.write_f32(stat.weight);
    w.write_f32(stat.count);
    w.write_f32(stat.reliability);
}

fn read_field(r: &mut Reader<'_>, field: Field, record: &mut AddrRecord) -> Result<(), CodecError> {
    match field {
        Field::OurLastTry => record.our_last_try = r.read_i64()?,
        Field::IgnoreTill => {
            r.read_i64()?;
        }
        Field::Stat2H => record.stat_2h = read_stat(r)?,
        Field::Stat8H => record.stat_8h = read_stat(r)?,
        Field::Stat1D => record.stat_1d = read_stat(r)?,
        Field::Stat1W => record.stat_1w = read_stat(r)?,
        Field::Stat1M => record.stat_1m = read_stat(r)?,
        Field::Total => record.total = r.read_i32()?,
        Field::Success => record.success = r.read_i32()?,
        Field::ClientVersion => record.client_version = r.read_i32()?,
        Field::ClientSubVersion => record.client_sub_version = r.read_string()?,
        Field::Blocks => record.blocks = r.read_i32()?,
        Field::OurLastSuccess => record.our_last_success = r.read_i64()?,
        Field::LastAddressRequest => record.last_address_request = r.read_i64()?,
        Field::CheckpointVerified => record.checkpoint_verified = r.read_bool()?,
    }
    Ok(())
}

/// Value taken by a field missing from an older record
fn default_absent(field: Field, record: &mut AddrRecord) {
    match field {
        Field::Stat1M => record.stat_1m = record.stat_1w,
        // Keep previously good peers live across an upgrade until proven bad
        Field::CheckpointVerified => record.checkpoint_verified = true,
        _ => {}
    }
}

fn write_field(w: &mut Writer, field: Field, record: &AddrRecord) {
    match field {
        Field::OurLastTry => w.write_i64(record.our_last_try),
        Field::IgnoreTill => w.write_i64(0),
        Field::Stat2H => write_stat(w, &record.stat_2h),
        Field::Stat8H => write_stat(w, &record.stat_8h),
        Field::Stat1D => write_stat(w, &record.stat_1d),
        Field::Stat1W => write_stat(w, &record.stat_1w),
        Field::Stat1M => write_stat(w, &record.stat_1m),
        Field::Total => w.write_i32(record.total),
        Field::Success => w.write_i32(record.success),
        Field::ClientVersion => w.write_i32(record.client_version),
        Field::ClientSubVersion => w.write_string(&record.client_sub_version),
        Field::Blocks => w.write_i32(record.blocks),
        Field::OurLastSuccess => w.write_i64(record.our_last_success),
        Field::LastAddressRequest => w.write_i64(record.last_address_request),
        Field::CheckpointVerified => w.write_bool(record.checkpoint_verified),
    }
}

/// Decode one record
pub fn read_record(r: &mut Reader<'_>, format: AddrFormat) -> Result<AddrRecord, CodecError> {
    let version = r.read_u8()?;
    if version > RECORD_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let endpoint = r.read_endpoint(format)?;
    let services = ServiceFlags(r.read_u64()?);
    let last_try = r.read_i64()?;
    let mut record = AddrRecord::new(endpoint, services, last_try);

    let tried = r.read_bool()?;
    if !tried {
        return Ok(record);
    }

    for (field, versions) in TRIED_LAYOUT {
        if versions.contains(&version) {
            read_field(r, *field, &mut record)?;
        } else {
            default_absent(*field, &mut record);
        }
    }
    Ok(record)
}

/// Encode one record using the given record version
pub fn write_record(
    w: &mut Writer,
    record: &AddrRecord,
    version: u8,
    format: AddrFormat,
) -> Result<(), CodecError> {
    if version > RECORD_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    w.write_u8(version);
    w.write_endpoint(&record.endpoint, format)?;
    w.write_u64(record.services.bits());
    w.write_i64(record.last_try);

    let tried = record.is_tried();
    w.write_bool(tried);
    if !tried {
        return Ok(());
    }

    for (field, versions) in TRIED_LAYOUT {
        if versions.contains(&version) {
            write_field(w, *field, record);
        }
    }
    Ok(())
}

/// Decoded contents of a persisted database
#[derive(Debug, Default)]
pub struct DbImage {
    pub records: Vec<AddrRecord>,
    pub banned: BTreeMap<Endpoint, i64>,
}

/// Decode a full database; the whole buffer must be consumed
pub fn read_database(bytes: &[u8]) -> Result<DbImage, CodecError> {
    let mut r = Reader::new(bytes);
    let version = r.read_u8()?;
    if version > DB_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let format = addr_format(version);

    let count = r.read_compact_size()?;
    let mut records = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        records.push(read_record(&mut r, format)?);
    }

    let banned_count = r.read_compact_size()?;
    let mut banned = BTreeMap::new();
    for _ in 0..banned_count {
        let endpoint = r.read_endpoint(format)?;
        let until = r.read_i64()?;
        banned.insert(endpoint, until);
    }

    if r.remaining() != 0 {
        return Err(CodecError::TrailingBytes(r.remaining()));
    }

    Ok(DbImage { records, banned })
}

/// Encode a full database, each record with its own record version
pub fn write_database(
    db_version: u8,
    records: &[(u8, &AddrRecord)],
    banned: &BTreeMap<Endpoint, i64>,
) -> Result<Vec<u8>, CodecError> {
    if db_version > DB_VERSION {
        return Err(CodecError::UnsupportedVersion(db_version));
    }
    let format = addr_format(db_version);

    let mut w = Writer::new();
    w.write_u8(db_version);
    w.write_compact_size(records.len() as u64);
    for (version, record) in records {
        write_record(&mut w, record, *version, format)?;
    }

    w.write_compact_size(banned.len() as u64);
    for (endpoint, until) in banned {
        w.write_endpoint(endpoint, format)?;
        w.write_i64(*until);
    }
    Ok(w.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::record::tests::{endpoint, reliable_record, NOW};
    use crate::types::NetAddr;

    fn tried_record() -> AddrRecord {
        let mut record = reliable_record();
        record.client_sub_version = "/Satoshi:0.21.0/".to_string();
        record.last_address_request = NOW - 50;
        record.update(false, NOW + 7200);
        record.checkpoint_verified = false;
        record
    }

    fn roundtrip(record: &AddrRecord, version: u8) -> AddrRecord {
        let mut w = Writer::new();
        write_record(&mut w, record, version, AddrFormat::V2).unwrap();
        let bytes = w.into_inner();
        let mut r = Reader::new(&bytes);
        let decoded = read_record(&mut r, AddrFormat::V2).unwrap();
        assert_eq!(r.remaining(), 0);
        decoded
    }

    #[test]
    fn test_current_version_preserves_everything() {
        let record = tried_record();
        assert_eq!(roundtrip(&record, RECORD_VERSION), record);
    }

    #[test]
    fn test_untried_record_is_short() {
        let record = AddrRecord::new(endpoint("1.2.3.4", 8333), ServiceFlags::NETWORK, NOW);
        let mut w = Writer::new();
        write_record(&mut w, &record, RECORD_VERSION, AddrFormat::V2).unwrap();
        // version + endpoint (1 + 1 + 4 + 2) + services + last_try + tried flag
        assert_eq!(w.into_inner().len(), 1 + 8 + 8 + 8 + 1);
        assert_eq!(roundtrip(&record, RECORD_VERSION), record);
    }

    #[test]
    fn test_old_versions_take_defaults() {
        let record = tried_record();

        let v0 = roundtrip(&record, 0);
        assert_eq!(v0.stat_1m, record.stat_1w);
        assert_eq!(v0.client_sub_version, "");
        assert_eq!(v0.blocks, 0);
        assert_eq!(v0.our_last_success, 0);
        assert_eq!(v0.last_address_request, 0);
        assert!(v0.checkpoint_verified);
        assert_eq!(v0.stat_2h, record.stat_2h);
        assert_eq!(v0.total, record.total);

        let v1 = roundtrip(&record, 1);
        assert_eq!(v1.stat_1m, record.stat_1m);
        assert_eq!(v1.client_sub_version, "");

        let v2 = roundtrip(&record, 2);
        assert_eq!(v2.client_sub_version, record.client_sub_version);
        assert_eq!(v2.blocks, 0);

        let v3 = roundtrip(&record, 3);
        assert_eq!(v3.blocks, record.blocks);
        assert_eq!(v3.our_last_success, 0);

        let v4 = roundtrip(&record, 4);
        assert_eq!(v4.our_last_success, record.our_last_success);
        assert_eq!(v4.last_address_request, 0);

        let v5 = roundtrip(&record, 5);
        assert_eq!(v5.last_address_request, record.last_address_request);
        assert!(v5.checkpoint_verified);

        let v6 = roundtrip(&record, 6);
        assert!(!v6.checkpoint_verified);
    }

    #[test]
    fn test_ignore_till_is_skipped() {
        let record = tried_record();
        let mut w5 = Writer::new();
        write_record(&mut w5, &record, 5, AddrFormat::V2).unwrap();
        let mut w6 = Writer::new();
        write_record(&mut w6, &record, 6, AddrFormat::V2).unwrap();

        // v5 carries an 8 byte ignore-till field, v6 carries a 1 byte checkpoint flag
        assert_eq!(w5.into_inner().len(), w6.into_inner().len() + 7);
    }

    #[test]
    fn test_rejects_future_record_version() {
        let mut w = Writer::new();
        w.write_u8(RECORD_VERSION + 1);
        let bytes = w.into_inner();
        let mut r = Reader::new(&bytes);
        assert_eq!(
            read_record(&mut r, AddrFormat::V2),
            Err(CodecError::UnsupportedVersion(RECORD_VERSION + 1))
        );
    }

    #[test]
    fn test_database_mixed_versions() {
        let tried = tried_record();
        let untried = AddrRecord::new(endpoint("5.6.7.8", 8333), ServiceFlags::NETWORK, NOW);
        let onion = AddrRecord::new(Endpoint::new(NetAddr::TorV3([9u8; 32]), 8333), ServiceFlags::NETWORK, NOW);

        let mut banned = BTreeMap::new();
        banned.insert(endpoint("9.9.9.9", 8333), NOW + 86_400);

        let mut records: Vec<(u8, &AddrRecord)> = (0..=RECORD_VERSION).map(|v| (v, &tried)).collect();
        records.push((RECORD_VERSION, &untried));
        records.push((3, &onion));

        let bytes = write_database(DB_VERSION, &records, &banned).unwrap();
        let image = read_database(&bytes).unwrap();

        assert_eq!(image.records.len(), records.len());
        assert_eq!(image.records[0].stat_1m, tried.stat_1w);
        assert!(image.records[5].checkpoint_verified);
        assert_eq!(image.records[6], tried);
        assert_eq!(image.records[7], untried);
        assert_eq!(image.records[8].endpoint, onion.endpoint);
        assert_eq!(image.banned, banned);
    }

    #[test]
    fn test_legacy_container_format() {
        let untried = AddrRecord::new(endpoint("5.6.7.8", 8333), ServiceFlags::NETWORK, NOW);
        let banned = BTreeMap::new();

        let bytes = write_database(0, &[(RECORD_VERSION, &untried)], &banned).unwrap();
        // version + count + record(1 + 18 + 8 + 8 + 1) + banned count
        assert_eq!(bytes.len(), 1 + 1 + 36 + 1);

        let image = read_database(&bytes).unwrap();
        assert_eq!(image.records, vec![untried]);
    }

    #[test]
    fn test_truncated_database_is_fatal() {
        let tried = tried_record();
        let bytes = write_database(DB_VERSION, &[(RECORD_VERSION, &tried)], &BTreeMap::new()).unwrap();

        for cut in [1, 2, 10, bytes.len() - 1] {
            assert!(read_database(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
        assert!(read_database(&[]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = write_database(DB_VERSION, &[], &BTreeMap::new()).unwrap();
        bytes.push(0);
        assert_eq!(read_database(&bytes).unwrap_err(), CodecError::TrailingBytes(1));
    }
}

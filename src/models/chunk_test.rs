use anyhow::Result;

use super::*;

#[test]
fn erasure_codec_parses_known_codecs() -> Result<()> {
    let lrc: ErasureCodec = "lrc_12_2_2".parse().map_err(anyhow::Error::msg)?;
    let rs: ErasureCodec = "reed_solomon_6_3".parse().map_err(anyhow::Error::msg)?;
    let none: ErasureCodec = "none".parse().map_err(anyhow::Error::msg)?;

    assert_eq!(lrc, ErasureCodec::Lrc { data: 12, parity: 2, local_parity: 2 }, "unexpected lrc codec parsed");
    assert_eq!(rs, ErasureCodec::ReedSolomon { data: 6, parity: 3 }, "unexpected reed-solomon codec parsed");
    assert_eq!(none, ErasureCodec::None, "unexpected none codec parsed");
    assert_eq!(lrc.to_string(), "lrc_12_2_2", "expected display to mirror the parsed name");
    assert_eq!(rs.to_string(), "reed_solomon_6_3", "expected display to mirror the parsed name");
    Ok(())
}

#[test]
fn erasure_codec_rejects_garbage() {
    for name in ["lrc_12_2", "reed_solomon_x_3", "raid5", "reed_solomon_0_3", "reed_solomon_200_100", "lrc_200_50_10"] {
        assert!(name.parse::<ErasureCodec>().is_err(), "expected codec {:?} to be rejected", name);
    }
}

#[test]
fn erasure_codec_part_layout() {
    let lrc = ErasureCodec::Lrc { data: 12, parity: 2, local_parity: 2 };
    assert_eq!(lrc.total_part_count(), 16, "expected 16 parts for lrc_12_2_2");
    assert!(lrc.is_data_part(11), "expected part 11 to be a data part");
    assert!(!lrc.is_data_part(12), "expected part 12 to be a parity part");
    assert_eq!(lrc.guaranteed_repairable_part_count(), 3, "expected lrc_12_2_2 to tolerate 3 erasures");

    let rs = ErasureCodec::ReedSolomon { data: 6, parity: 3 };
    assert_eq!(rs.guaranteed_repairable_part_count(), 3, "expected reed_solomon_6_3 to tolerate 3 erasures");
    assert_eq!(ErasureCodec::None.total_part_count(), 1, "expected regular chunks to have one part");
}

#[test]
fn erasure_codec_validation_bounds_part_counts() {
    assert!(ErasureCodec::None.validate().is_ok());
    assert!(ErasureCodec::Lrc { data: 12, parity: 2, local_parity: 2 }.validate().is_ok());
    assert!(ErasureCodec::ReedSolomon { data: 200, parity: 55 }.validate().is_ok(), "expected 255 parts to fit");

    let oversized = ErasureCodec::ReedSolomon { data: 200, parity: 100 };
    assert!(oversized.validate().is_err(), "expected more than 255 parts to be rejected");
    assert_eq!(oversized.total_part_count(), u8::MAX, "expected part count to saturate instead of overflowing");
    let oversized = ErasureCodec::Lrc { data: 250, parity: 4, local_parity: 4 };
    assert!(oversized.validate().is_err(), "expected more than 255 lrc parts to be rejected");
    assert!(ErasureCodec::ReedSolomon { data: 0, parity: 3 }.validate().is_err(), "expected empty data parts to be rejected");
    assert!(ErasureCodec::Lrc { data: 4, parity: 2, local_parity: 0 }.validate().is_err());
}

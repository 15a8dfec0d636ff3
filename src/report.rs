//! Result persistence: the tabular sweep report and the selected label
//! volume.
//!
//! The label volume is written as a NumPy `.npy` v1.0 file (`<i4`, C
//! order, shape `(Z, Y, X)`) so downstream tooling can load it without a
//! custom reader.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::error::Result;
use crate::sweep::SweepRecord;
use crate::volume::Volume;

/// File name of the tabular sweep report.
pub const RESULTS_FILE: &str = "optimization_results.csv";

/// File name for the persisted label volume at the chosen radius.
pub fn labels_file_name(radius: u32) -> String {
    format!("labels_r{radius}.npy")
}

/// Write the sweep table, one row per radius in the given order.
pub fn write_sweep_csv(records: &[SweepRecord], output_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(RESULTS_FILE);

    let mut writer = csv::Writer::from_path(&path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    info!("saved sweep table to {path:?} ({} rows)", records.len());
    Ok(path)
}

/// Write a label volume as `labels_r{radius}.npy` in `output_dir`.
pub fn write_labels_npy(
    labels: &Volume<i32>,
    radius: u32,
    output_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(labels_file_name(radius));

    let mut file = BufWriter::new(File::create(&path)?);
    let shape = labels.shape();
    write_npy_header(&mut file, &[shape.slices, shape.rows, shape.cols])?;
    for &value in labels.data() {
        file.write_all(&value.to_le_bytes())?;
    }
    file.flush()?;

    info!("saved label volume to {path:?}");
    Ok(path)
}

/// NumPy `.npy` format 1.0 header for a little-endian i32 C-order array.
fn write_npy_header(writer: &mut impl Write, shape: &[usize]) -> Result<()> {
    let dims = shape
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    // A trailing comma keeps single-element tuples valid Python.
    let shape_tuple = if shape.len() == 1 {
        format!("({dims},)")
    } else {
        format!("({dims})")
    };
    let mut header = format!(
        "{{'descr': '<i4', 'fortran_order': False, 'shape': {shape_tuple}, }}"
    );

    // Magic (6) + version (2) + header length (2) + header, padded with
    // spaces to a multiple of 64 and terminated with a newline.
    let unpadded = 10 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.extend(std::iter::repeat_n(' ', padding));
    header.push('\n');

    writer.write_all(b"\x93NUMPY")?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&(header.len() as u16).to_le_bytes())?;
    writer.write_all(header.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeShape;
    use tempfile::TempDir;

    fn record(radius: u32) -> SweepRecord {
        SweepRecord {
            radius,
            particle_count: 42,
            mean_contacts: 5.5,
            largest_particle_ratio: 0.025,
            interior_particle_count: 30,
            excluded_particle_count: 12,
            processing_time: 1.25,
            total_volume: 9000,
            largest_particle_volume: 225,
        }
    }

    // =========================================================================
    // CSV Report Tests
    // =========================================================================

    mod csv_report {
        use super::*;

        #[test]
        fn header_matches_expected_columns() {
            let dir = TempDir::new().unwrap();
            let path = write_sweep_csv(&[record(1)], dir.path()).unwrap();

            let content = std::fs::read_to_string(path).unwrap();
            let header = content.lines().next().unwrap();
            assert_eq!(
                header,
                "radius,particle_count,mean_contacts,largest_particle_ratio,\
                 interior_particle_count,excluded_particle_count,processing_time,\
                 total_volume,largest_particle_volume"
            );
        }

        #[test]
        fn one_row_per_record_in_order() {
            let dir = TempDir::new().unwrap();
            let path = write_sweep_csv(&[record(1), record(2), record(3)], dir.path()).unwrap();

            let content = std::fs::read_to_string(path).unwrap();
            let rows: Vec<&str> = content.lines().skip(1).collect();
            assert_eq!(rows.len(), 3);
            assert!(rows[0].starts_with("1,42,"));
            assert!(rows[1].starts_with("2,42,"));
            assert!(rows[2].starts_with("3,42,"));
        }

        #[test]
        fn empty_sweep_still_writes_the_file() {
            let dir = TempDir::new().unwrap();
            let path = write_sweep_csv(&[], dir.path()).unwrap();
            assert!(path.exists());
        }

        #[test]
        fn creates_missing_output_directory() {
            let dir = TempDir::new().unwrap();
            let nested = dir.path().join("a").join("b");
            let path = write_sweep_csv(&[record(1)], &nested).unwrap();
            assert!(path.exists());
        }
    }

    // =========================================================================
    // NPY Writer Tests
    // =========================================================================

    mod npy {
        use super::*;

        fn labels_2x2x3() -> Volume<i32> {
            let shape = VolumeShape {
                slices: 2,
                rows: 2,
                cols: 3,
            };
            Volume::from_vec(shape, (0..12).collect())
        }

        #[test]
        fn file_name_embeds_radius() {
            assert_eq!(labels_file_name(4), "labels_r4.npy");
        }

        #[test]
        fn magic_and_version_are_correct() {
            let dir = TempDir::new().unwrap();
            let path = write_labels_npy(&labels_2x2x3(), 2, dir.path()).unwrap();
            let bytes = std::fs::read(path).unwrap();

            assert_eq!(&bytes[..6], b"\x93NUMPY");
            assert_eq!(bytes[6], 1);
            assert_eq!(bytes[7], 0);
        }

        #[test]
        fn header_declares_dtype_and_shape() {
            let dir = TempDir::new().unwrap();
            let path = write_labels_npy(&labels_2x2x3(), 2, dir.path()).unwrap();
            let bytes = std::fs::read(path).unwrap();

            let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
            let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();
            assert!(header.contains("'descr': '<i4'"));
            assert!(header.contains("'fortran_order': False"));
            assert!(header.contains("'shape': (2, 2, 3)"));
            assert!(header.ends_with('\n'));
        }

        #[test]
        fn total_header_length_is_64_aligned() {
            let dir = TempDir::new().unwrap();
            let path = write_labels_npy(&labels_2x2x3(), 2, dir.path()).unwrap();
            let bytes = std::fs::read(path).unwrap();

            let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
            assert_eq!((10 + header_len) % 64, 0);
        }

        #[test]
        fn payload_is_little_endian_i32_in_c_order() {
            let dir = TempDir::new().unwrap();
            let path = write_labels_npy(&labels_2x2x3(), 2, dir.path()).unwrap();
            let bytes = std::fs::read(path).unwrap();

            let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
            let payload = &bytes[10 + header_len..];
            assert_eq!(payload.len(), 12 * 4);

            let first = i32::from_le_bytes(payload[..4].try_into().unwrap());
            let last = i32::from_le_bytes(payload[44..48].try_into().unwrap());
            assert_eq!(first, 0);
            assert_eq!(last, 11);
        }
    }
}

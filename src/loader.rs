//! Slice-stack loading: scan a folder of grayscale images and stack them
//! into a single 3D volume at native bit depth.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use log::warn;

use crate::error::{Error, Result};
use crate::volume::{GrayVolume, Volume, VolumeShape};

/// Slice extensions accepted by default (case-insensitive).
pub const DEFAULT_EXTENSIONS: [&str; 2] = ["tif", "tiff"];

/// Stacks with fewer slices than this trigger a warning; meaningful 3D
/// statistics need a reasonably tall stack.
const MIN_SLICES_FOR_WARNING: usize = 50;

/// Validate that the input folder exists and is a directory.
pub fn validate_input_folder(input: &Path) -> Result<()> {
    if !input.exists() || !input.is_dir() {
        return Err(Error::FolderMissing(input.to_path_buf()));
    }
    Ok(())
}

/// Scan `folder` (non-recursively) for slice files with one of the accepted
/// extensions, returning them in natural order with case-insensitive
/// duplicates removed.
pub fn collect_slice_files(folder: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    validate_input_folder(folder)?;

    let entries = fs::read_dir(folder)?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| {
                    extensions
                        .iter()
                        .any(|accepted| ext.eq_ignore_ascii_case(accepted))
                })
        })
        .collect();

    if files.is_empty() {
        return Err(Error::NoMatchingFiles {
            folder: folder.to_path_buf(),
            extensions: extensions.iter().map(|s| (*s).to_string()).collect(),
        });
    }

    files.sort_by(|a, b| natural_cmp(&file_name_lossy(a), &file_name_lossy(b)));

    // Case-insensitive filesystems can report the same slice twice.
    files.dedup_by(|a, b| {
        file_name_lossy(a).eq_ignore_ascii_case(&file_name_lossy(b))
    });

    Ok(files)
}

/// Load a folder of grayscale slices into a dense 3D volume.
///
/// The first slice fixes `(rows, cols)` and the bit depth; every later slice
/// must match both. 16-bit sources are kept at 16 bits.
pub fn load_volume(folder: &Path, extensions: &[&str]) -> Result<GrayVolume> {
    let files = collect_slice_files(folder, extensions)?;

    if files.len() < MIN_SLICES_FOR_WARNING {
        warn!(
            "only {} slice(s) found in {:?}; statistics from short stacks are unreliable",
            files.len(),
            folder
        );
    }

    let first = decode_slice(&files[0])?;
    let (rows, cols) = (first.height() as usize, first.width() as usize);
    let depth = slice_bit_depth(&first);

    let shape = VolumeShape {
        slices: files.len(),
        rows,
        cols,
    };

    match depth {
        16 => {
            let mut data = vec![0_u16; shape.len()];
            stack_slices(&files, shape, &mut data, |img, path| {
                check_depth(img, 16, path)?;
                Ok(img.to_luma16().into_raw())
            })?;
            Ok(GrayVolume::U16(Volume::from_vec(shape, data)))
        }
        _ => {
            let mut data = vec![0_u8; shape.len()];
            stack_slices(&files, shape, &mut data, |img, path| {
                check_depth(img, 8, path)?;
                Ok(img.to_luma8().into_raw())
            })?;
            Ok(GrayVolume::U8(Volume::from_vec(shape, data)))
        }
    }
}

/// Decode one slice image, mapping decode failures to `UnreadableSlice`.
fn decode_slice(path: &Path) -> Result<DynamicImage> {
    image::ImageReader::open(path)
        .map_err(|e| Error::UnreadableSlice {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .decode()
        .map_err(|e| Error::UnreadableSlice {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Bit depth of a decoded slice: 16 for 16-bit sample formats, 8 otherwise.
fn slice_bit_depth(img: &DynamicImage) -> u8 {
    match img {
        DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => 16,
        _ => 8,
    }
}

fn check_depth(img: &DynamicImage, expected: u8, path: &Path) -> Result<()> {
    let actual = slice_bit_depth(img);
    if actual != expected {
        return Err(Error::BitDepthMismatch {
            expected,
            actual,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Decode every slice into the flat volume buffer, checking shape agreement.
fn stack_slices<T: Copy>(
    files: &[PathBuf],
    shape: VolumeShape,
    data: &mut [T],
    to_pixels: impl Fn(&DynamicImage, &Path) -> Result<Vec<T>>,
) -> Result<()> {
    let slice_len = shape.rows * shape.cols;
    for (z, path) in files.iter().enumerate() {
        let img = decode_slice(path)?;
        let (h, w) = (img.height() as usize, img.width() as usize);
        if h != shape.rows || w != shape.cols {
            return Err(Error::ShapeMismatch {
                expected_rows: shape.rows,
                expected_cols: shape.cols,
                actual_rows: h,
                actual_cols: w,
                path: path.clone(),
            });
        }
        let pixels = to_pixels(&img, path)?;
        data[z * slice_len..(z + 1) * slice_len].copy_from_slice(&pixels);
    }
    Ok(())
}

fn file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Natural filename ordering: digit runs compare as integers, everything
/// else case-insensitively. `slice_2.tif` sorts before `slice_10.tif`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ta = tokenize(a).into_iter();
    let mut tb = tokenize(b).into_iter();

    loop {
        match (ta.next(), tb.next()) {
            (None, None) => break,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (&x, &y) {
                    (Token::Number(nx, sx), Token::Number(ny, sy)) => {
                        // Equal values with different zero padding still need
                        // a stable order.
                        nx.cmp(ny).then_with(|| sx.len().cmp(&sy.len()))
                    }
                    (Token::Number(..), Token::Text(_)) => Ordering::Less,
                    (Token::Text(_), Token::Number(..)) => Ordering::Greater,
                    (Token::Text(sx), Token::Text(sy)) => {
                        sx.to_lowercase().cmp(&sy.to_lowercase())
                    }
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }

    // All tokens equal: fall back to a case-sensitive tie-break so the order
    // is total.
    a.cmp(b)
}

#[derive(Debug)]
enum Token {
    Number(u128, String),
    Text(String),
}

fn tokenize(s: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_is_digit: Option<bool> = None;

    for c in s.chars() {
        let is_digit = c.is_ascii_digit();
        if current_is_digit != Some(is_digit) && !current.is_empty() {
            tokens.push(make_token(&current, current_is_digit == Some(true)));
            current.clear();
        }
        current.push(c);
        current_is_digit = Some(is_digit);
    }
    if !current.is_empty() {
        tokens.push(make_token(&current, current_is_digit == Some(true)));
    }
    tokens
}

fn make_token(s: &str, is_digit: bool) -> Token {
    if is_digit {
        // Saturate absurdly long digit runs rather than failing the sort.
        let value = s.parse::<u128>().unwrap_or(u128::MAX);
        Token::Number(value, s.to_string())
    } else {
        Token::Text(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, Luma};
    use tempfile::TempDir;

    fn write_gray_tiff(dir: &Path, name: &str, w: u32, h: u32, value: u8) {
        let img = GrayImage::from_pixel(w, h, Luma([value]));
        img.save(dir.join(name)).unwrap();
    }

    fn write_gray16_tiff(dir: &Path, name: &str, w: u32, h: u32, value: u16) {
        let img: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_pixel(w, h, Luma([value]));
        img.save(dir.join(name)).unwrap();
    }

    // =========================================================================
    // Natural Ordering Tests
    // =========================================================================

    mod natural_order {
        use super::*;

        #[test]
        fn numeric_runs_compare_as_integers() {
            assert_eq!(natural_cmp("slice_2.tif", "slice_10.tif"), Ordering::Less);
            assert_eq!(natural_cmp("slice_100.tif", "slice_99.tif"), Ordering::Greater);
        }

        #[test]
        fn text_compares_case_insensitively() {
            assert_eq!(natural_cmp("Slice_1.tif", "slice_2.tif"), Ordering::Less);
            assert_eq!(natural_cmp("ABC.tif", "abd.tif"), Ordering::Less);
        }

        #[test]
        fn zero_padding_does_not_change_rank() {
            let mut names = vec!["img010.tif", "img2.tif", "img1.tif"];
            names.sort_by(|a, b| natural_cmp(a, b));
            assert_eq!(names, vec!["img1.tif", "img2.tif", "img010.tif"]);
        }

        #[test]
        fn equal_values_with_different_padding_are_ordered() {
            assert_eq!(natural_cmp("img7.tif", "img007.tif"), Ordering::Less);
        }

        #[test]
        fn plain_text_sorts_lexicographically() {
            let mut names = vec!["zebra.tif", "apple.tif", "Mango.tif"];
            names.sort_by(|a, b| natural_cmp(a, b));
            assert_eq!(names, vec!["apple.tif", "Mango.tif", "zebra.tif"]);
        }

        #[test]
        fn mixed_prefix_numbers_sort_before_text() {
            assert_eq!(natural_cmp("1_first.tif", "first.tif"), Ordering::Less);
        }
    }

    // =========================================================================
    // Folder Scanning Tests
    // =========================================================================

    mod scanning {
        use super::*;

        #[test]
        fn missing_folder_fails() {
            let err = collect_slice_files(Path::new("/no/such/folder"), &DEFAULT_EXTENSIONS)
                .unwrap_err();
            assert!(matches!(err, Error::FolderMissing(_)));
        }

        #[test]
        fn file_as_folder_fails() {
            let dir = TempDir::new().unwrap();
            let file = dir.path().join("file.txt");
            fs::write(&file, "x").unwrap();
            let err = collect_slice_files(&file, &DEFAULT_EXTENSIONS).unwrap_err();
            assert!(matches!(err, Error::FolderMissing(_)));
        }

        #[test]
        fn empty_folder_reports_no_matching_files() {
            let dir = TempDir::new().unwrap();
            let err = collect_slice_files(dir.path(), &DEFAULT_EXTENSIONS).unwrap_err();
            assert!(matches!(err, Error::NoMatchingFiles { .. }));
        }

        #[test]
        fn non_matching_extensions_are_ignored() {
            let dir = TempDir::new().unwrap();
            fs::write(dir.path().join("notes.txt"), "x").unwrap();
            fs::write(dir.path().join("image.png"), "x").unwrap();
            let err = collect_slice_files(dir.path(), &DEFAULT_EXTENSIONS).unwrap_err();
            assert!(matches!(err, Error::NoMatchingFiles { .. }));
        }

        #[test]
        fn tif_and_tiff_both_match() {
            let dir = TempDir::new().unwrap();
            write_gray_tiff(dir.path(), "a.tif", 4, 4, 0);
            write_gray_tiff(dir.path(), "b.tiff", 4, 4, 0);
            let files = collect_slice_files(dir.path(), &DEFAULT_EXTENSIONS).unwrap();
            assert_eq!(files.len(), 2);
        }

        #[test]
        fn extension_matching_is_case_insensitive() {
            let dir = TempDir::new().unwrap();
            write_gray_tiff(dir.path(), "upper.TIF", 4, 4, 0);
            let files = collect_slice_files(dir.path(), &DEFAULT_EXTENSIONS).unwrap();
            assert_eq!(files.len(), 1);
        }

        #[test]
        fn case_insensitive_duplicates_collapse_to_one() {
            // A case-insensitive filesystem can surface the same slice
            // under two spellings; only one may enter the stack.
            let dir = TempDir::new().unwrap();
            write_gray_tiff(dir.path(), "Slice1.tif", 4, 4, 0);
            write_gray_tiff(dir.path(), "slice1.tif", 4, 4, 0);
            let files = collect_slice_files(dir.path(), &DEFAULT_EXTENSIONS).unwrap();
            assert_eq!(files.len(), 1);
        }

        #[test]
        fn files_come_back_in_natural_order() {
            let dir = TempDir::new().unwrap();
            for name in ["s10.tif", "s2.tif", "s1.tif"] {
                write_gray_tiff(dir.path(), name, 4, 4, 0);
            }
            let files = collect_slice_files(dir.path(), &DEFAULT_EXTENSIONS).unwrap();
            let names: Vec<String> = files
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect();
            assert_eq!(names, vec!["s1.tif", "s2.tif", "s10.tif"]);
        }
    }

    // =========================================================================
    // Volume Stacking Tests
    // =========================================================================

    mod stacking {
        use super::*;

        #[test]
        fn stacks_u8_slices_in_order() {
            let dir = TempDir::new().unwrap();
            write_gray_tiff(dir.path(), "s1.tif", 3, 2, 10);
            write_gray_tiff(dir.path(), "s2.tif", 3, 2, 20);
            write_gray_tiff(dir.path(), "s3.tif", 3, 2, 30);

            let vol = load_volume(dir.path(), &DEFAULT_EXTENSIONS).unwrap();
            assert_eq!(vol.bit_depth(), 8);
            let shape = vol.shape();
            assert_eq!((shape.slices, shape.rows, shape.cols), (3, 2, 3));

            assert_eq!(vol.value_at(shape.index(0, 0, 0)), 10);
            assert_eq!(vol.value_at(shape.index(1, 1, 2)), 20);
            assert_eq!(vol.value_at(shape.index(2, 0, 1)), 30);
        }

        #[test]
        fn preserves_16_bit_values() {
            let dir = TempDir::new().unwrap();
            write_gray16_tiff(dir.path(), "s1.tif", 2, 2, 40_000);
            write_gray16_tiff(dir.path(), "s2.tif", 2, 2, 300);

            let vol = load_volume(dir.path(), &DEFAULT_EXTENSIONS).unwrap();
            assert_eq!(vol.bit_depth(), 16);
            let shape = vol.shape();
            assert_eq!(vol.value_at(shape.index(0, 0, 0)), 40_000);
            assert_eq!(vol.value_at(shape.index(1, 1, 1)), 300);
        }

        #[test]
        fn single_slice_is_acceptable() {
            let dir = TempDir::new().unwrap();
            write_gray_tiff(dir.path(), "only.tif", 4, 4, 128);
            let vol = load_volume(dir.path(), &DEFAULT_EXTENSIONS).unwrap();
            assert_eq!(vol.shape().slices, 1);
        }

        #[test]
        fn shape_mismatch_is_fatal() {
            let dir = TempDir::new().unwrap();
            write_gray_tiff(dir.path(), "s1.tif", 4, 4, 0);
            write_gray_tiff(dir.path(), "s2.tif", 5, 4, 0);

            let err = load_volume(dir.path(), &DEFAULT_EXTENSIONS).unwrap_err();
            assert!(matches!(err, Error::ShapeMismatch { .. }));
        }

        #[test]
        fn depth_mismatch_is_fatal() {
            let dir = TempDir::new().unwrap();
            write_gray_tiff(dir.path(), "s1.tif", 4, 4, 0);
            write_gray16_tiff(dir.path(), "s2.tif", 4, 4, 0);

            let err = load_volume(dir.path(), &DEFAULT_EXTENSIONS).unwrap_err();
            assert!(matches!(err, Error::BitDepthMismatch { .. }));
        }

        #[test]
        fn corrupt_file_is_unreadable() {
            let dir = TempDir::new().unwrap();
            fs::write(dir.path().join("bad.tif"), b"not a tiff").unwrap();

            let err = load_volume(dir.path(), &DEFAULT_EXTENSIONS).unwrap_err();
            assert!(matches!(err, Error::UnreadableSlice { .. }));
        }
    }
}

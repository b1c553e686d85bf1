use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::DynError;

const HXT_LABEL: &[u8; 8] = b"HEXITECH";
// Version 3 pads the file-prefix region to a fixed width and grows the
// timestamp field.
const V3_PREFIX_REGION_BYTES: usize = 100;
const V2_TIMESTAMP_BYTES: usize = 13;
const V3_TIMESTAMP_BYTES: usize = 16;

/// Spectral cube as written by the detector acquisition software: per pixel,
/// one binned energy spectrum. Data is stored pixel-major, all bins of a
/// pixel contiguous.
#[derive(Debug)]
pub struct HxtCube {
    version: u64,
    mss: [u32; 4],
    gal: [u32; 5],
    file_prefix: String,
    timestamp: String,
    rows: u32,
    cols: u32,
    bins: u32,
    bin_labels: Vec<f64>,
    data: Vec<f64>,
}

impl HxtCube {
    pub fn read(path: &Path) -> Result<Self, DynError> {
        let file = File::open(path)
            .map_err(|e| format!("Cannot open HXT file {}: {e}", path.display()))?;
        let mut reader = BufReader::new(file);
        Self::from_reader(&mut reader)
            .map_err(|e| format!("HXT file {}: {e}", path.display()).into())
    }

    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self, DynError> {
        let mut label = [0u8; 8];
        reader.read_exact(&mut label)?;
        if &label != HXT_LABEL {
            return Err("unknown file type (missing HEXITECH label)".into());
        }

        let version = read_u64(reader)?;
        if version != 2 && version != 3 {
            return Err(format!("unsupported HXT version {version}").into());
        }

        let mut mss = [0u32; 4];
        for slot in mss.iter_mut() {
            *slot = read_u32(reader)?;
        }
        let mut gal = [0u32; 5];
        for slot in gal.iter_mut() {
            *slot = read_u32(reader)?;
        }

        let prefix_size = read_i32(reader)?;
        if prefix_size < 0 {
            return Err(format!("negative file prefix length {prefix_size}").into());
        }
        let prefix_size = prefix_size as usize;
        let file_prefix = read_nul_padded_string(reader, prefix_size)?;

        let timestamp_size = if version == 3 {
            if prefix_size > V3_PREFIX_REGION_BYTES {
                return Err(format!(
                    "file prefix length {prefix_size} exceeds the version 3 header region"
                )
                .into());
            }
            skip_bytes(reader, V3_PREFIX_REGION_BYTES - prefix_size)?;
            V3_TIMESTAMP_BYTES
        } else {
            V2_TIMESTAMP_BYTES
        };
        let timestamp = read_nul_padded_string(reader, timestamp_size)?;

        let rows = read_u32(reader)?;
        let cols = read_u32(reader)?;
        let bins = read_u32(reader)?;
        let pixels = rows as usize * cols as usize;
        if pixels == 0 || bins == 0 {
            return Err(format!("degenerate cube geometry {rows}x{cols}x{bins}").into());
        }

        let mut bin_labels = Vec::with_capacity(bins as usize);
        for _ in 0..bins {
            bin_labels.push(read_f64(reader)?);
        }

        let mut data = vec![0.0f64; pixels * bins as usize];
        for value in data.iter_mut() {
            *value = read_f64(reader)?;
        }

        Ok(Self {
            version,
            mss,
            gal,
            file_prefix,
            timestamp,
            rows,
            cols,
            bins,
            bin_labels,
            data,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn mss(&self) -> [u32; 4] {
        self.mss
    }

    pub fn gal(&self) -> [u32; 5] {
        self.gal
    }

    pub fn file_prefix(&self) -> &str {
        &self.file_prefix
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn num_bins(&self) -> u32 {
        self.bins
    }

    pub fn bin_label(&self, bin: usize) -> Option<f64> {
        self.bin_labels.get(bin).copied()
    }

    /// One spatial slice of the cube, row-major rows x cols.
    #[allow(dead_code)]
    pub fn bin(&self, bin: usize) -> Result<Vec<f64>, DynError> {
        if bin >= self.bins as usize {
            return Err(format!("bin {bin} out of range (cube has {})", self.bins).into());
        }
        let pixels = self.rows as usize * self.cols as usize;
        let mut slice = Vec::with_capacity(pixels);
        for pixel in 0..pixels {
            slice.push(self.data[pixel * self.bins as usize + bin]);
        }
        Ok(slice)
    }

    /// Total counts in one energy bin across all pixels.
    pub fn bin_total(&self, bin: usize) -> f64 {
        self.data
            .iter()
            .skip(bin)
            .step_by(self.bins as usize)
            .sum()
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, DynError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32, DynError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, DynError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

fn read_f64<R: Read>(reader: &mut R) -> Result<f64, DynError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(f64::from_ne_bytes(buf))
}

fn skip_bytes<R: Read>(reader: &mut R, count: usize) -> Result<(), DynError> {
    let mut scratch = vec![0u8; count];
    reader.read_exact(&mut scratch)?;
    Ok(())
}

fn read_nul_padded_string<R: Read>(reader: &mut R, len: usize) -> Result<String, DynError> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn push_u32(out: &mut Vec<u8>, value: u32) {
        out.extend_from_slice(&value.to_ne_bytes());
    }

    fn push_f64(out: &mut Vec<u8>, value: f64) {
        out.extend_from_slice(&value.to_ne_bytes());
    }

    fn cube_bytes(version: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(HXT_LABEL);
        out.extend_from_slice(&version.to_ne_bytes());
        for value in 1..=9u32 {
            push_u32(&mut out, value);
        }
        let prefix = b"scan01";
        out.extend_from_slice(&(prefix.len() as i32).to_ne_bytes());
        out.extend_from_slice(prefix);
        if version == 3 {
            out.extend_from_slice(&vec![0u8; V3_PREFIX_REGION_BYTES - prefix.len()]);
            out.extend_from_slice(b"160716_153317\0\0\0");
        } else {
            out.extend_from_slice(b"160716_153317");
        }
        push_u32(&mut out, 2); // rows
        push_u32(&mut out, 2); // cols
        push_u32(&mut out, 3); // bins
        for b in 0..3 {
            push_f64(&mut out, b as f64 * 0.25);
        }
        // Pixel-major: all bins of pixel (y, x) contiguous.
        for pixel in 0..4 {
            for bin in 0..3 {
                push_f64(&mut out, (pixel * 10 + bin) as f64);
            }
        }
        out
    }

    #[test]
    fn reads_version_2_cube() {
        let bytes = cube_bytes(2);
        let cube = HxtCube::from_reader(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(cube.version(), 2);
        assert_eq!(cube.mss(), [1, 2, 3, 4]);
        assert_eq!(cube.gal(), [5, 6, 7, 8, 9]);
        assert_eq!(cube.file_prefix(), "scan01");
        assert_eq!(cube.timestamp(), "160716_153317");
        assert_eq!((cube.rows(), cube.cols(), cube.num_bins()), (2, 2, 3));
        assert_eq!(cube.bin_label(1), Some(0.25));
        assert_eq!(cube.bin_label(3), None);

        // Bin 1 across the four pixels.
        assert_eq!(cube.bin(1).unwrap(), vec![1.0, 11.0, 21.0, 31.0]);
        assert_eq!(cube.bin_total(1), 64.0);
    }

    #[test]
    fn reads_version_3_padded_prefix() {
        let bytes = cube_bytes(3);
        let cube = HxtCube::from_reader(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(cube.version(), 3);
        assert_eq!(cube.file_prefix(), "scan01");
        assert_eq!(cube.timestamp(), "160716_153317");
        assert_eq!(cube.bin(0).unwrap(), vec![0.0, 10.0, 20.0, 30.0]);
    }

    #[test]
    fn rejects_unknown_label() {
        let mut bytes = cube_bytes(2);
        bytes[0] = b'X';
        let err = HxtCube::from_reader(&mut Cursor::new(bytes)).unwrap_err();
        assert!(err.to_string().contains("unknown file type"));
    }

    #[test]
    fn rejects_unsupported_version() {
        let bytes = cube_bytes(4);
        let err = HxtCube::from_reader(&mut Cursor::new(bytes)).unwrap_err();
        assert!(err.to_string().contains("unsupported HXT version"));
    }

    #[test]
    fn bin_out_of_range_is_an_error() {
        let cube = HxtCube::from_reader(&mut Cursor::new(cube_bytes(2))).unwrap();
        assert!(cube.bin(3).is_err());
    }
}

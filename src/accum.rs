use crate::frame::SAMPLES_PER_FRAME;
use crate::DynError;

pub const RAW_HIST_BINS: usize = 8192;
pub const RAW_BIN_DIVISOR: u16 = 8;
pub const CALIB_HIST_BINS: usize = 1000;
pub const CALIB_BIN_SCALE: f64 = 10.0;
pub const CALIB_VALUE_MAX: f64 = 10_000.0;

/// Running accumulation across the frame stream: one spatial sum image and
/// two energy histograms. Owned by the driver, mutated once per frame.
///
/// Every histogram write is bounds-checked first; samples whose bin falls
/// outside the array are dropped, never written out of range.
#[derive(Debug)]
pub struct AccumulatorState {
    sum_image: Vec<f64>,
    raw_hist: Vec<u64>,
    calib_hist: Vec<u64>,
}

impl AccumulatorState {
    pub fn new() -> Self {
        Self {
            sum_image: vec![0.0; SAMPLES_PER_FRAME],
            raw_hist: vec![0; RAW_HIST_BINS],
            calib_hist: vec![0; CALIB_HIST_BINS],
        }
    }

    /// Bin the raw 16-bit samples of one frame at ADC/8 resolution.
    pub fn ingest_raw_histogram(&mut self, samples: &[u16]) -> Result<(), DynError> {
        check_frame_len(samples.len())?;
        for &value in samples {
            let bin = (value / RAW_BIN_DIVISOR) as usize;
            if bin < RAW_HIST_BINS {
                self.raw_hist[bin] += 1;
            }
        }
        Ok(())
    }

    /// フレームを合計画像へ加算する。純粋な加算なので順序に依存しない。
    pub fn ingest_spatial(&mut self, frame: &[f64]) -> Result<(), DynError> {
        check_frame_len(frame.len())?;
        for (acc, &value) in self.sum_image.iter_mut().zip(frame.iter()) {
            *acc += value;
        }
        Ok(())
    }

    /// Bin calibrated pixel values at value*10 resolution. Only values in the
    /// open interval (0, 10000) are considered, and of those only bins below
    /// the array length are counted; the rest are dropped.
    pub fn ingest_calibrated_histogram(&mut self, frame: &[f64]) -> Result<(), DynError> {
        check_frame_len(frame.len())?;
        for &value in frame {
            if value > 0.0 && value < CALIB_VALUE_MAX {
                let bin = (value * CALIB_BIN_SCALE).floor() as usize;
                if bin < CALIB_HIST_BINS {
                    self.calib_hist[bin] += 1;
                }
            }
        }
        Ok(())
    }

    /// Fold another accumulator into this one. Addition is associative and
    /// commutative for the counts, so partitioned accumulation merged this
    /// way matches sequential ingestion.
    #[allow(dead_code)]
    pub fn merge(&mut self, other: &AccumulatorState) {
        for (acc, &value) in self.sum_image.iter_mut().zip(other.sum_image.iter()) {
            *acc += value;
        }
        for (acc, &count) in self.raw_hist.iter_mut().zip(other.raw_hist.iter()) {
            *acc += count;
        }
        for (acc, &count) in self.calib_hist.iter_mut().zip(other.calib_hist.iter()) {
            *acc += count;
        }
    }

    pub fn sum_image(&self) -> &[f64] {
        &self.sum_image
    }

    pub fn raw_histogram(&self) -> &[u64] {
        &self.raw_hist
    }

    pub fn calibrated_histogram(&self) -> &[u64] {
        &self.calib_hist
    }
}

#[inline(always)]
fn check_frame_len(len: usize) -> Result<(), DynError> {
    if len != SAMPLES_PER_FRAME {
        return Err(format!(
            "Accumulator input must contain {SAMPLES_PER_FRAME} values, received {len}"
        )
        .into());
    }
    Ok(())
}

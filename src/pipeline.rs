use std::io::{ErrorKind, Read};

use rayon::prelude::*;

use crate::accum::AccumulatorState;
use crate::calib::CalibrationTable;
use crate::frame::{decode_record, ReorderPlan, BYTES_PER_FRAME, SAMPLES_PER_FRAME};
use crate::DynError;

// Upper bound on records resident at once while the parallel mode computes.
const MAX_FRAMES_PER_IO_CHUNK: usize = 256;
const PROGRESS_INTERVAL_FRAMES: usize = 1000;

#[derive(Debug)]
pub struct RunSummary {
    pub state: AccumulatorState,
    pub frames_processed: usize,
}

/// Drive the stream to completion: read fixed-size records, decode, reorder,
/// calibrate and accumulate, stopping at end of stream or at `frame_cap`.
/// A trailing record shorter than a full frame marks the end of the stream
/// and is discarded without error.
pub fn run<R: Read>(
    reader: &mut R,
    calib: &CalibrationTable,
    plan: &ReorderPlan,
    frame_cap: Option<usize>,
    workers: usize,
) -> Result<RunSummary, DynError> {
    if workers == 0 {
        return Err("Worker count must be at least 1".into());
    }
    if workers == 1 {
        run_sequential(reader, calib, plan, frame_cap)
    } else {
        run_chunked(reader, calib, plan, frame_cap)
    }
}

fn run_sequential<R: Read>(
    reader: &mut R,
    calib: &CalibrationTable,
    plan: &ReorderPlan,
    frame_cap: Option<usize>,
) -> Result<RunSummary, DynError> {
    let mut state = AccumulatorState::new();
    let mut record = vec![0u8; BYTES_PER_FRAME];
    let mut samples = vec![0u16; SAMPLES_PER_FRAME];
    let mut spatial = vec![0.0f64; SAMPLES_PER_FRAME];
    let mut frames_processed = 0usize;
    let mut last_milestone = 0usize;

    loop {
        if let Some(cap) = frame_cap {
            if frames_processed >= cap {
                break;
            }
        }
        let bytes_read = read_full(reader, &mut record)
            .map_err(|e| format!("frame {frames_processed}: failed to read record: {e}"))?;
        if bytes_read < BYTES_PER_FRAME {
            break;
        }
        decode_record(&record, &mut samples)
            .map_err(|e| format!("frame {frames_processed}: {e}"))?;
        state.ingest_raw_histogram(&samples)?;
        plan.reorder_into(&samples, &mut spatial)?;
        calib.apply(&mut spatial)?;
        state.ingest_spatial(&spatial)?;
        state.ingest_calibrated_histogram(&spatial)?;
        frames_processed += 1;
        report_progress(frames_processed, &mut last_milestone);
    }

    Ok(RunSummary {
        state,
        frames_processed,
    })
}

/// Chunked variant: decode/reorder/calibrate are pure per-frame stages, so a
/// whole chunk is computed concurrently, then ingested in frame order. The
/// ingest order makes the result identical to the sequential path for any
/// worker count.
fn run_chunked<R: Read>(
    reader: &mut R,
    calib: &CalibrationTable,
    plan: &ReorderPlan,
    frame_cap: Option<usize>,
) -> Result<RunSummary, DynError> {
    let mut state = AccumulatorState::new();
    let mut frames_processed = 0usize;
    let mut last_milestone = 0usize;

    loop {
        let remaining = match frame_cap {
            Some(cap) => cap - frames_processed,
            None => usize::MAX,
        };
        let frames_wanted = remaining.min(MAX_FRAMES_PER_IO_CHUNK);
        if frames_wanted == 0 {
            break;
        }
        let requested_bytes = frames_wanted * BYTES_PER_FRAME;
        let mut block = vec![0u8; requested_bytes];
        let bytes_read = read_full(reader, &mut block)
            .map_err(|e| format!("frame {frames_processed}: failed to read record: {e}"))?;
        let frames_read = bytes_read / BYTES_PER_FRAME;
        if frames_read == 0 {
            break;
        }
        block.truncate(frames_read * BYTES_PER_FRAME);

        let chunk_start = frames_processed;
        let computed = block
            .par_chunks_exact(BYTES_PER_FRAME)
            .enumerate()
            .map(|(offset, record)| {
                let mut samples = vec![0u16; SAMPLES_PER_FRAME];
                decode_record(record, &mut samples)
                    .map_err(|e| format!("frame {}: {e}", chunk_start + offset))?;
                let mut spatial = vec![0.0f64; SAMPLES_PER_FRAME];
                plan.reorder_into(&samples, &mut spatial)?;
                calib.apply(&mut spatial)?;
                Ok((samples, spatial))
            })
            .collect::<Result<Vec<(Vec<u16>, Vec<f64>)>, DynError>>()?;

        for (samples, spatial) in &computed {
            state.ingest_raw_histogram(samples)?;
            state.ingest_spatial(spatial)?;
            state.ingest_calibrated_histogram(spatial)?;
            frames_processed += 1;
            report_progress(frames_processed, &mut last_milestone);
        }

        if bytes_read < requested_bytes {
            break;
        }
    }

    Ok(RunSummary {
        state,
        frames_processed,
    })
}

fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<usize, DynError> {
    let mut total_read = 0usize;
    while total_read < buffer.len() {
        match reader.read(&mut buffer[total_read..]) {
            Ok(0) => break,
            Ok(n) => total_read += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total_read)
}

fn report_progress(frames_processed: usize, last_milestone: &mut usize) {
    let milestone = frames_processed / PROGRESS_INTERVAL_FRAMES;
    if milestone > *last_milestone {
        *last_milestone = milestone;
        println!("[info] Processed {frames_processed} frames");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    use crate::frame::SAMPLES_PER_FRAME;

    fn identity_calibration() -> CalibrationTable {
        CalibrationTable::from_spatial_grids(
            vec![1.0; SAMPLES_PER_FRAME],
            vec![0.0; SAMPLES_PER_FRAME],
            vec![0.0; SAMPLES_PER_FRAME],
        )
        .unwrap()
    }

    fn record_of(value: u16) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BYTES_PER_FRAME);
        for _ in 0..SAMPLES_PER_FRAME {
            bytes.extend_from_slice(&value.to_ne_bytes());
        }
        bytes
    }

    #[test]
    fn short_trailing_record_terminates_without_error() {
        let mut stream = Vec::new();
        for _ in 0..3 {
            stream.extend_from_slice(&record_of(50));
        }
        stream.extend_from_slice(&record_of(50)[..BYTES_PER_FRAME / 2]);

        let plan = ReorderPlan::new();
        let calib = identity_calibration();
        let mut cursor = Cursor::new(stream);
        let summary = run(&mut cursor, &calib, &plan, None, 1).unwrap();

        assert_eq!(summary.frames_processed, 3);
        // Identity calibration: every pixel saw 50 three times.
        assert!(summary.state.sum_image().iter().all(|&v| v == 150.0));
        // 50/8 = bin 6 in the raw histogram, 50*10 = bin 500 calibrated.
        assert_eq!(summary.state.raw_histogram()[6], (3 * SAMPLES_PER_FRAME) as u64);
        assert_eq!(
            summary.state.calibrated_histogram()[500],
            (3 * SAMPLES_PER_FRAME) as u64
        );
    }

    #[test]
    fn frame_cap_stops_without_reading_further_records() {
        let mut stream = Vec::new();
        for _ in 0..5 {
            stream.extend_from_slice(&record_of(50));
        }
        let plan = ReorderPlan::new();
        let calib = identity_calibration();

        let mut cursor = Cursor::new(stream.clone());
        let summary = run(&mut cursor, &calib, &plan, Some(2), 1).unwrap();
        assert_eq!(summary.frames_processed, 2);
        assert_eq!(cursor.position(), (2 * BYTES_PER_FRAME) as u64);

        // Chunked mode sizes its reads from the cap, so it stops at the same
        // byte offset.
        let mut cursor = Cursor::new(stream);
        let summary = run(&mut cursor, &calib, &plan, Some(2), 4).unwrap();
        assert_eq!(summary.frames_processed, 2);
        assert_eq!(cursor.position(), (2 * BYTES_PER_FRAME) as u64);
    }

    #[test]
    fn empty_stream_processes_zero_frames() {
        let plan = ReorderPlan::new();
        let calib = identity_calibration();
        let mut cursor = Cursor::new(Vec::new());
        let summary = run(&mut cursor, &calib, &plan, None, 1).unwrap();
        assert_eq!(summary.frames_processed, 0);
        assert!(summary.state.sum_image().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn chunked_mode_matches_sequential_exactly() {
        let mut stream = Vec::new();
        for n in 0..7u16 {
            let mut record = Vec::with_capacity(BYTES_PER_FRAME);
            for i in 0..SAMPLES_PER_FRAME {
                let value = ((i as u32 * 13 + n as u32 * 257) % 65536) as u16;
                record.extend_from_slice(&value.to_ne_bytes());
            }
            stream.extend_from_slice(&record);
        }
        let plan = ReorderPlan::new();
        let slope: Vec<f64> = (0..SAMPLES_PER_FRAME).map(|i| 0.001 * (i % 9) as f64).collect();
        let intercept: Vec<f64> = (0..SAMPLES_PER_FRAME).map(|i| (i % 4) as f64).collect();
        let calib = CalibrationTable::from_spatial_grids(
            slope,
            intercept,
            vec![0.0; SAMPLES_PER_FRAME],
        )
        .unwrap();

        let mut cursor = Cursor::new(stream.clone());
        let sequential = run(&mut cursor, &calib, &plan, None, 1).unwrap();
        let mut cursor = Cursor::new(stream);
        let chunked = run(&mut cursor, &calib, &plan, None, 4).unwrap();

        assert_eq!(chunked.frames_processed, sequential.frames_processed);
        assert_eq!(chunked.state.sum_image(), sequential.state.sum_image());
        assert_eq!(chunked.state.raw_histogram(), sequential.state.raw_histogram());
        assert_eq!(
            chunked.state.calibrated_histogram(),
            sequential.state.calibrated_histogram()
        );
    }

    struct FailingReader {
        prefix: Cursor<Vec<u8>>,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.prefix.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            Err(io::Error::new(io::ErrorKind::Other, "device fault"))
        }
    }

    #[test]
    fn read_failure_mid_stream_is_fatal_with_frame_index() {
        let mut reader = FailingReader {
            prefix: Cursor::new(record_of(10)),
        };
        let plan = ReorderPlan::new();
        let calib = identity_calibration();
        let err = run(&mut reader, &calib, &plan, None, 1).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("frame 1"), "unexpected message: {message}");
        assert!(message.contains("device fault"));
    }
}

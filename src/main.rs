mod accum;
mod args;
mod calib;
mod frame;
mod hxt;
mod pipeline;

use std::error::Error;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
#[cfg(target_family = "unix")]
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser};

use accum::AccumulatorState;
use calib::CalibrationTable;
use frame::{ReorderPlan, BYTES_PER_FRAME, FRAME_COLS, FRAME_ROWS};
use hxt::HxtCube;

pub type DynError = Box<dyn Error + Send + Sync>;

fn main() -> Result<(), DynError> {
    if std::env::args_os().len() == 1 {
        args::Args::command().print_help()?;
        println!();
        return Ok(());
    }

    let args = args::Args::parse();

    if let Some(hxt_path) = &args.hxt_info {
        return print_hxt_info(hxt_path);
    }

    args::validate_cpu(args.cpu)?;
    let data_path = args
        .data
        .as_ref()
        .ok_or("--data is required (or use --hxt-info)")?;
    let slopes_path = args.slopes.as_ref().ok_or("--slopes is required")?;
    let intercepts_path = args.intercepts.as_ref().ok_or("--intercepts is required")?;
    let thresholds_path = args.thresholds.as_ref().ok_or("--thresholds is required")?;

    if args.cpu > 1 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.cpu)
            .build_global()?;
    }

    let plan = ReorderPlan::new();
    let calibration =
        CalibrationTable::load(slopes_path, intercepts_path, thresholds_path, &plan)?;

    let output_dir = resolve_output_layout(&args, data_path)?;

    println!("Starting frame accumulation with the following arguments:");
    println!("--------------------------------------------------");
    println!("  data:       {}", data_path.display());
    println!("  slopes:     {}", slopes_path.display());
    println!("  intercepts: {}", intercepts_path.display());
    println!("  thresholds: {}", thresholds_path.display());
    match args.frames {
        Some(cap) => println!("  frames:     {cap} (cap)"),
        None => println!("  frames:     until stream end"),
    }
    println!("  cpu:        {}", args.cpu);
    println!("  results:    {}", output_dir.display());
    println!("--------------------------------------------------");

    let data_file = File::open(data_path)
        .map_err(|e| format!("Cannot open frame stream {}: {e}", data_path.display()))?;
    advise_file_sequential(&data_file);
    let mut reader = BufReader::new(data_file);

    let summary = pipeline::run(&mut reader, &calibration, &plan, args.frames, args.cpu)?;

    println!(
        "[info] Final frame count is {} ({} bytes consumed as whole records)",
        summary.frames_processed,
        summary.frames_processed * BYTES_PER_FRAME
    );

    write_results(&output_dir, &summary.state)?;
    Ok(())
}

fn print_hxt_info(path: &Path) -> Result<(), DynError> {
    let cube = HxtCube::read(path)?;
    println!("HXT cube: {}", path.display());
    println!("  version:    {}", cube.version());
    let [mss_x, mss_y, mss_z, mss_rot] = cube.mss();
    println!("  mss:        {mss_x}, {mss_y}, {mss_z}, rot {mss_rot}");
    let [gal_x, gal_y, gal_z, gal_rot, gal_rot2] = cube.gal();
    println!("  gal:        {gal_x}, {gal_y}, {gal_z}, rot {gal_rot}/{gal_rot2}");
    println!("  prefix:     {}", cube.file_prefix());
    println!("  timestamp:  {}", cube.timestamp());
    println!(
        "  geometry:   {} rows x {} cols x {} bins",
        cube.rows(),
        cube.cols(),
        cube.num_bins()
    );
    for bin in 0..cube.num_bins() as usize {
        let label = cube.bin_label(bin).unwrap_or(f64::NAN);
        println!(
            "  bin {bin:4}: label {label:10.3}  total {:14.1}",
            cube.bin_total(bin)
        );
    }
    Ok(())
}

#[cfg(target_family = "unix")]
fn advise_file_sequential(file: &File) {
    let fd = file.as_raw_fd();
    unsafe {
        let _ = libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

#[cfg(not(target_family = "unix"))]
fn advise_file_sequential(_file: &File) {}

fn resolve_output_layout(args: &args::Args, data_path: &Path) -> Result<PathBuf, DynError> {
    let output_dir = if let Some(dir) = args.output.clone() {
        dir
    } else {
        let run_stem = data_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("hexitec_spectra")
            .to_string();
        PathBuf::from("hexitec_spectra").join(run_stem)
    };
    std::fs::create_dir_all(&output_dir)
        .map_err(|e| format!("Cannot create output directory {}: {e}", output_dir.display()))?;
    Ok(output_dir)
}

fn write_results(output_dir: &Path, state: &AccumulatorState) -> Result<(), DynError> {
    let image_path = output_dir.join("sum_image.txt");
    write_image_text(&image_path, state.sum_image())?;

    let raw_path = output_dir.join("raw_histogram.txt");
    write_histogram_text(&raw_path, state.raw_histogram())?;

    let calib_path = output_dir.join("calibrated_histogram.txt");
    write_histogram_text(&calib_path, state.calibrated_histogram())?;

    println!(
        "[info] Wrote {}, {}, {}",
        image_path.display(),
        raw_path.display(),
        calib_path.display()
    );
    Ok(())
}

fn write_image_text(path: &Path, image: &[f64]) -> Result<(), DynError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for row in 0..FRAME_ROWS {
        for col in 0..FRAME_COLS {
            if col > 0 {
                write!(writer, " ")?;
            }
            write!(writer, "{}", image[row * FRAME_COLS + col])?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_histogram_text(path: &Path, histogram: &[u64]) -> Result<(), DynError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for count in histogram {
        writeln!(writer, "{count}")?;
    }
    writer.flush()?;
    Ok(())
}

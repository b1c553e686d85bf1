use clap::Parser;
use std::path::PathBuf;

use crate::DynError;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "HEXITEC raw frame decoder and spectrum accumulator",
    long_about = None,
    arg_required_else_help = true,
    after_help = "Examples:\n  hexitec_spectra --data scan.bin --slopes 500V_28C_Grads.txt --intercepts 500V_28C_Inters.txt --thresholds 500V_28C_Thresh.txt\n  hexitec_spectra --data scan.bin --slopes Grads.txt --intercepts Inters.txt --thresholds Thresh.txt --frames 10000 --cpu 4\n  hexitec_spectra --hxt-info scan.hxt\n"
)]
pub struct Args {
    /// Path to the raw frame stream (headerless 12800-byte records)
    #[arg(long, visible_alias = "bin")]
    pub data: Option<PathBuf>,

    /// Per-pixel gain slope grid (text, 6400 values in readout order)
    #[arg(long, visible_alias = "grads")]
    pub slopes: Option<PathBuf>,

    /// Per-pixel intercept grid (text, 6400 values in readout order)
    #[arg(long, visible_alias = "inters")]
    pub intercepts: Option<PathBuf>,

    /// Per-pixel threshold grid (text, 6400 values in readout order)
    #[arg(long, visible_alias = "thresh")]
    pub thresholds: Option<PathBuf>,

    /// Stop after this many frames (default: run until the stream ends)
    #[arg(long)]
    pub frames: Option<usize>,

    /// Output directory for the sum image and histograms (default: derived
    /// from the data file stem)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Number of worker threads for frame decode and calibration
    #[arg(long, default_value_t = 1)]
    pub cpu: usize,

    /// Print the metadata of a HEXITEC .hxt spectral cube and exit
    #[arg(long = "hxt-info")]
    pub hxt_info: Option<PathBuf>,
}

pub fn validate_cpu(cpu: usize) -> Result<(), DynError> {
    if cpu == 0 {
        return Err("--cpu must be at least 1".into());
    }
    let available_cores = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } as usize;
    if cpu > available_cores {
        return Err(format!(
            "--cpu value ({cpu}) exceeds the number of available cores ({available_cores})"
        )
        .into());
    }
    Ok(())
}

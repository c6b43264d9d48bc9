//! `inodectl` changes the inode-table capacity of an unmounted ext4
//! filesystem: it raises or lowers the inodes-per-group parameter, resizing
//! every group's inode table in place while preserving all data.

mod calc;
mod cluster;
mod extmap;
mod grow;
mod relocate;
mod resize;
mod rewrite;
mod shrink;
#[cfg(test)]
mod testfs;

use calc::Outcome;
use calc::Target;
use ext4::fs::Ext4Fs;
use ext4::io::IoChannel;
use ext4::sb::STATE_ERROR;
use ext4::sb::STATE_VALID;
use resize::Pass;
use std::env;
use std::ffi::c_long;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::exit;

/// ioctl command: flush the block device's buffer cache.
const BLKFLSBUF: c_long = (0x12 << 8) | 97;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// The name of the current program used in command line.
    prog: String,
    /// Force the operation on unclean or restricted filesystems.
    force: bool,
    /// Flush the device caches before opening.
    flush: bool,
    /// Print pass progress.
    progress: bool,
    /// Debug flag bitmask.
    debug: u32,
    /// Path of the undo file, when requested explicitly.
    undo_file: Option<PathBuf>,
    /// The requested target.
    target: Option<Target>,
    /// Both `-c` and `-r` were given.
    conflicting_target: bool,
    /// If true, print command line help.
    help: bool,
    /// The device holding the filesystem.
    device: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut args: Args = Default::default();
    let mut iter = env::args();
    args.prog = iter.next().unwrap_or("inodectl".to_owned());

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            "-f" => args.force = true,
            "-F" => args.flush = true,
            "-p" => args.progress = true,
            "-d" => {
                args.debug = iter
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| usage(&args.prog));
            }
            "-z" => {
                let file = iter.next().unwrap_or_else(|| usage(&args.prog));
                args.undo_file = Some(file.into());
            }
            "-c" => {
                let value = iter
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| usage(&args.prog));
                if args.target.is_some() {
                    args.conflicting_target = true;
                }
                args.target = Some(Target::Count(value));
            }
            "-r" => {
                let value = iter
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| usage(&args.prog));
                if args.target.is_some() {
                    args.conflicting_target = true;
                }
                args.target = Some(Target::Ratio(value));
            }
            _ => {
                if args.device.is_some() {
                    usage(&args.prog);
                }
                args.device = Some(arg.into());
            }
        }
    }
    args
}

/// Prints command usage, then exits.
fn usage(prog: &str) -> ! {
    eprintln!(
        "Usage: {prog} [-f] {{ -c <count> | -r <ratio> }} [-d <debug>] [-F] [-p] [-z <undo_file>] <device>"
    );
    exit(1);
}

/// Prints command help.
fn print_help(prog: &str) {
    println!();
    println!("Usage:");
    println!(" {prog} [options] {{ -c <count> | -r <ratio> }} <device>");
    println!();
    println!("Changes the inode count of an unmounted ext4 filesystem.");
    println!();
    println!("Options:");
    println!(" -c <count>\tTarget inode count.");
    println!(" -r <ratio>\tTarget bytes-per-inode ratio.");
    println!(" -f\t\tForce the operation.");
    println!(" -F\t\tFlush the device caches before starting.");
    println!(" -p\t\tPrint pass progress.");
    println!(" -d <flags>\tDebug flag bitmask.");
    println!(" -z <file>\tWrite an undo log to the given file.");
    println!(" -h, --help\tPrints help.");
}

/// Writes an error to stderr, then exits.
fn error<M: std::fmt::Display>(prog: &str, msg: M) -> ! {
    eprintln!("{prog}: error: {msg}");
    exit(1);
}

/// Tells whether the device is currently mounted.
fn is_mounted(device: &Path) -> bool {
    let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
        return false;
    };
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|src| Path::new(src) == device)
}

/// Flushes the device's buffer cache.
fn flush_device(file: &File) {
    unsafe {
        libc::ioctl(file.as_raw_fd(), BLKFLSBUF as _, 0);
    }
}

/// Opens the undo file for the transaction, honoring `-z` and the
/// `E2FSPROGS_UNDO_DIR` environment variable.
fn setup_undo(prog: &str, device: &Path, undo_file: &Option<PathBuf>) -> Option<File> {
    let path = match undo_file {
        Some(path) => path.clone(),
        None => {
            let dir = env::var("E2FSPROGS_UNDO_DIR")
                .unwrap_or_else(|_| "/var/lib/e2fsprogs".to_owned());
            if dir.is_empty() || dir == "none" {
                return None;
            }
            let dir = PathBuf::from(dir);
            let writable = fs::metadata(&dir)
                .map(|m| m.is_dir() && !m.permissions().readonly())
                .unwrap_or(false);
            if !writable {
                return None;
            }
            let dev_name = device
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_owned());
            dir.join(format!("inodectl-{dev_name}.undo"))
        }
    };

    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error(prog, format_args!("{}: {e}", path.display()));
        }
    }
    match File::create(&path) {
        Ok(file) => {
            println!(
                "Overwriting existing filesystem; this can be undone with the undo file:\n    {}",
                path.display()
            );
            Some(file)
        }
        Err(e) => error(prog, format_args!("{}: {e}", path.display())),
    }
}

/// Checks whether the filesystem looks unclean and demands a checker run
/// before being modified.
fn check_clean(prog: &str, device: &Path, fs: &Ext4Fs) {
    let state = fs.sb.s_state;
    let lastcheck = fs.sb.s_lastcheck;
    let mtime = fs.sb.s_mtime;
    let last_orphan = fs.sb.s_last_orphan;
    let free_inodes = fs.sb.s_free_inodes_count;
    let inodes = fs.sb.s_inodes_count;

    let mut checkit = state & STATE_ERROR != 0 || state & STATE_VALID == 0;
    checkit |= lastcheck < mtime;
    checkit |= fs.sb.free_blocks_count() > fs.sb.blocks_count() || free_inodes > inodes;
    checkit |= last_orphan != 0 || fs.sb.has_journal_needs_recovery();

    if checkit {
        eprintln!("{prog}: please run 'e2fsck -f {}' first.", device.display());
        exit(1);
    }
}

/// The simple progress meter driven by the transaction's pass callback.
#[derive(Default)]
struct ProgressMeter {
    cur_pass: Option<Pass>,
    last_percent: u64,
}

impl ProgressMeter {
    fn update(&mut self, pass: Pass, cur: u64, max: u64) {
        if max == 0 {
            return;
        }
        if self.cur_pass != Some(pass) {
            self.cur_pass = Some(pass);
            self.last_percent = 0;
            let label = match pass {
                Pass::ExtendItable => "Extending the inode table",
                Pass::BlockReloc => "Relocating blocks",
                Pass::InodeScan => "Scanning inode table",
                Pass::InodeRefUpd => "Updating inode references",
                Pass::MoveItable => "Moving inode table",
            };
            println!("Begin pass {} (max = {max})", pass as i32);
            println!("{label}");
        }
        let percent = cur * 100 / max;
        if percent / 10 > self.last_percent / 10 {
            self.last_percent = percent;
            println!("  {percent}%");
        }
    }
}

fn main() {
    let args = parse_args();
    let prog = args.prog.clone();

    if args.help {
        print_help(&prog);
        exit(0);
    }
    if args.conflicting_target {
        eprintln!("{prog}: specify either '-c' for an inode count or '-r' for an inode ratio");
        exit(1);
    }
    let (Some(target), Some(device)) = (args.target, args.device.clone()) else {
        usage(&prog);
    };

    if is_mounted(&device) {
        eprintln!(
            "{prog}: {} is mounted; online change is not supported",
            device.display()
        );
        exit(1);
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_EXCL)
        .open(&device)
        .unwrap_or_else(|e| {
            error(&prog, format_args!("{}: {e}", device.display()));
        });
    if args.flush {
        flush_device(&file);
    }

    let mut io = IoChannel::new(Box::new(file), 1024);
    if let Some(undo) = setup_undo(&prog, &device, &args.undo_file) {
        io.enable_undo(undo).unwrap_or_else(|e| {
            error(&prog, format_args!("cannot set up the undo file: {e}"));
        });
    }

    let mut fs = Ext4Fs::open(&mut io).unwrap_or_else(|e| {
        eprintln!("{prog}: {}: {e}", device.display());
        eprintln!("Couldn't find a valid filesystem superblock.");
        exit(1);
    });

    if !args.force {
        check_clean(&prog, &device, &fs);
        if fs.sb.has_bigalloc() {
            eprintln!(
                "{prog}: resizing bigalloc filesystems has not been fully tested; \
                 use the force option to go ahead anyway"
            );
            exit(1);
        }
    }

    let new_ipg = match calc::calculate_new_inodes_per_group(&fs, target, args.force) {
        Ok(Outcome::NoChange) => {
            let count = fs.sb.s_inodes_count;
            println!("The filesystem already has {count} inodes. No change needed.");
            exit(0);
        }
        Ok(Outcome::Change(ipg)) => ipg,
        Err(e) => error(&prog, e),
    };

    let cur_ipg = fs.sb.s_inodes_per_group;
    let growing = new_ipg > cur_ipg;

    if fs.sb.has_stable_inodes() {
        if growing {
            if args.force {
                println!(
                    "Increasing the inode count despite the stable_inodes feature, \
                     because the force flag is set"
                );
            } else {
                eprintln!(
                    "{prog}: this filesystem has the stable_inodes feature; \
                     reducing the inode count later will not be possible. \
                     Re-run with the force flag to proceed."
                );
                exit(1);
            }
        } else {
            eprintln!(
                "{prog}: cannot reduce the inode count: the filesystem has the \
                 stable_inodes feature"
            );
            exit(1);
        }
    }

    if growing && (!fs.sb.has_flex_bg() || fs.sb.s_log_groups_per_flex == 0) {
        // Without flexible groups, the last group must hold its own new
        // table; refuse early when it cannot
        let ibpg = (new_ipg as u64 * fs.sb.inode_size() as u64).div_ceil(fs.blocksize as u64);
        fs.read_bitmaps(&mut io).unwrap_or_else(|e| error(&prog, e));
        calc::check_space_last_group(&mut io, &fs, ibpg).unwrap_or_else(|e| error(&prog, e));
        // The transaction re-reads the bitmaps itself
        fs = Ext4Fs::open(&mut io).unwrap_or_else(|e| error(&prog, e));
    }

    let mut meter = ProgressMeter::default();
    let mut progress_cb = |pass: Pass, cur: u64, max: u64| -> ext4::Result<()> {
        meter.update(pass, cur, max);
        Ok(())
    };
    let progress: Option<&mut resize::ProgressFn<'_>> = if args.progress {
        Some(&mut progress_cb)
    } else {
        None
    };

    let result = if growing {
        grow::increase_inode_count(&mut io, fs, args.debug, progress, new_ipg)
    } else {
        shrink::reduce_inode_count(&mut io, fs, args.debug, progress, new_ipg)
    };

    match result {
        Ok(count) => {
            println!(
                "The filesystem on {} now has {count} inodes.",
                device.display()
            );
        }
        Err(e) => {
            eprintln!(
                "{prog}: error while trying to modify the inode count on {}: {e}",
                device.display()
            );
            eprintln!(
                "Please run 'e2fsck -fy {}' to fix the filesystem\nafter the aborted operation.",
                device.display()
            );
            exit(1);
        }
    }
}

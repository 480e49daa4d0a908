//! Copy-truncate log rotation with tar.gz archiving.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek};
use std::path::{Path, PathBuf};

use chrono::Utc;

#[derive(Debug)]
pub enum RotationOutcome {
	/// The log was missing and has been recreated empty, or was zero-sized.
	Skipped,
	Completed {
		filesize: u64,
		archivesize: u64,
		location: PathBuf,
		filename: String,
	},
	Failed {
		reason: String,
	},
}

pub struct RotationPaths {
	pub log_path: PathBuf,
	pub archive_dir: PathBuf,
}

/// Run one rotation cycle: copy the log aside, truncate the original in
/// place, then gzip+tar the copy into the archive directory. Emits
/// `BACKUP STARTED` to the `"rotation"` tracing target once a non-empty
/// log is confirmed; the caller renders `BACKUP COMPLETE`/`BACKUP FAILED`
/// from the returned outcome.
pub fn rotate(paths: &RotationPaths) -> io::Result<RotationOutcome> {
	let metadata = match std::fs::metadata(&paths.log_path) {
		Ok(m) => m,
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			File::create(&paths.log_path)?;
			return Ok(RotationOutcome::Skipped);
		}
		Err(e) => return Err(e),
	};
	if metadata.len() == 0 {
		return Ok(RotationOutcome::Skipped);
	}
	let filesize = metadata.len();
	tracing::info!(target: "rotation", event = "BACKUP STARTED", filesize);

	let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
	let copy_path = paths.log_path.with_extension(format!("log.{stamp}.copy"));
	std::fs::copy(&paths.log_path, &copy_path)?;

	truncate_in_place(&paths.log_path)?;

	match compress_and_archive(&copy_path, &paths.archive_dir, &stamp) {
		Ok((archive_path, archivesize)) => {
			let _ = std::fs::remove_file(&copy_path);
			Ok(RotationOutcome::Completed {
				filesize,
				archivesize,
				location: archive_path.clone(),
				filename: archive_path.file_name().unwrap_or_default().to_string_lossy().into_owned(),
			})
		}
		Err(e) => {
			let _ = std::fs::remove_file(&copy_path);
			Ok(RotationOutcome::Failed { reason: e.to_string() })
		}
	}
}

/// Truncate the file to zero length without reopening it at a new inode,
/// so writers holding the original file descriptor keep appending to the
/// same underlying file.
fn truncate_in_place(path: &Path) -> io::Result<()> {
	let file = OpenOptions::new().write(true).open(path)?;
	file.set_len(0)?;
	let mut file = file;
	file.seek(io::SeekFrom::Start(0))?;
	Ok(())
}

fn compress_and_archive(copy_path: &Path, archive_dir: &Path, stamp: &str) -> io::Result<(PathBuf, u64)> {
	std::fs::create_dir_all(archive_dir)?;
	let log_name = copy_path
		.file_name()
		.and_then(|n| n.to_str())
		.unwrap_or("main.log")
		.replacen(&format!(".{stamp}.copy"), "", 1);
	let archive_name = format!("{log_name}.{stamp}.tar.gz");
	let archive_path = archive_dir.join(&archive_name);

	let archive_file = File::create(&archive_path)?;
	let encoder = flate2::write::GzEncoder::new(archive_file, flate2::Compression::default());
	let mut builder = tar::Builder::new(encoder);
	let entry_name = format!("{log_name}.{stamp}.copy");
	builder.append_path_with_name(copy_path, &entry_name)?;
	builder.into_inner()?.finish()?;

	let archivesize = std::fs::metadata(&archive_path)?.len();
	Ok((archive_path, archivesize))
}

/// Whether a cycle should fire: either enough days have passed since the
/// last run, or the log has grown past `max_bytes`.
pub fn should_rotate(days_since_last: f64, interval_days: f64, current_bytes: u64, max_bytes: u64) -> bool {
	days_since_last >= interval_days || current_bytes >= max_bytes
}

/// Persist the last-run timestamp via write-temp-then-rename, matching
/// `counters.rs`'s persistence idiom.
pub fn persist_last_run(path: &Path, when: chrono::DateTime<Utc>) -> io::Result<()> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let tmp_path = path.with_extension("tmp");
	std::fs::write(&tmp_path, when.to_rfc3339())?;
	std::fs::rename(&tmp_path, path)?;
	Ok(())
}

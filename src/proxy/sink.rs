//! Writing the categorized output trees
//!
//! Each run wipes and recreates the bucket directories under the base
//! path, then writes one `<protocol>.txt` per protocol per bucket.
//! Which directories exist depends on the geolocation and anonymity
//! toggles; stale directories from a previous run are always removed.

use crate::proxy::aggregate::Buckets;
use crate::proxy::models::{Protocol, VerifiedProxy};
use crate::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

const ALL_DIR: &str = "proxies";
const ANONYMOUS_DIR: &str = "proxies_anonymous";
const GEO_DIR: &str = "proxies_geolocation";
const GEO_ANONYMOUS_DIR: &str = "proxies_geolocation_anonymous";

const ALL_DIRS: [&str; 4] = [ALL_DIR, ANONYMOUS_DIR, GEO_DIR, GEO_ANONYMOUS_DIR];

/// Sink writing verified proxies into categorized directories
pub struct OutputSink {
    base: PathBuf,
    geolocation: bool,
    anonymity: bool,
}

impl OutputSink {
    pub fn new<P: AsRef<Path>>(base: P, geolocation: bool, anonymity: bool) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            geolocation,
            anonymity,
        }
    }

    /// Directories active under the current toggles
    fn active_dirs(&self) -> Vec<&'static str> {
        let mut dirs = vec![ALL_DIR];
        if self.anonymity {
            dirs.push(ANONYMOUS_DIR);
        }
        if self.geolocation {
            dirs.push(GEO_DIR);
            if self.anonymity {
                dirs.push(GEO_ANONYMOUS_DIR);
            }
        }
        dirs
    }

    /// Replace any previous output with the given buckets
    pub fn write(&self, buckets: &Buckets) -> Result<()> {
        fs::create_dir_all(&self.base)?;
        for dir in ALL_DIRS {
            match fs::remove_dir_all(self.base.join(dir)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        for dir in self.active_dirs() {
            fs::create_dir(self.base.join(dir))?;
        }

        self.write_bucket(ALL_DIR, &buckets.all, false)?;
        if self.anonymity {
            self.write_bucket(ANONYMOUS_DIR, &buckets.anonymous_only, false)?;
        }
        if self.geolocation {
            self.write_bucket(GEO_DIR, &buckets.all_geo, true)?;
            if self.anonymity {
                self.write_bucket(GEO_ANONYMOUS_DIR, &buckets.anonymous_only_geo, true)?;
            }
        }

        info!(base = %self.base.display(), "output written");
        Ok(())
    }

    /// Write one bucket as per-protocol files; protocols with no
    /// records get no file
    fn write_bucket(&self, dir: &str, records: &[VerifiedProxy], with_geo: bool) -> Result<()> {
        for protocol in Protocol::ALL {
            let lines: Vec<String> = records
                .iter()
                .filter(|p| p.candidate.protocol == protocol)
                .map(|p| {
                    if with_geo {
                        p.render_geo()
                    } else {
                        p.render_plain()
                    }
                })
                .collect();

            if lines.is_empty() {
                continue;
            }

            let path = self.base.join(dir).join(format!("{protocol}.txt"));
            fs::write(path, lines.join("\n") + "\n")?;
        }
        Ok(())
    }
}

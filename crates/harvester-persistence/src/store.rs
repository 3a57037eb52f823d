use crate::{PersistenceError, Result};
use harvester_core::{Job, JobError, JobId, JobOutcome, JobStatus};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Configuration for the job store
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    pub data_dir: PathBuf,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        JobStoreConfig {
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Unique key -> (job id, status) index
const CF_KEYS: &str = "keys";
const CF_META: &str = "meta";

const META_NEXT_ID: &[u8] = b"next_id";

/// A job to be inserted with status `Created`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub external_id: Option<u64>,
    pub key: String,
}

impl NewJob {
    /// Job received from the server
    pub fn remote(external_id: u64, key: impl Into<String>) -> Self {
        NewJob {
            external_id: Some(external_id),
            key: key.into(),
        }
    }

    /// Job uploaded through the local admin channel
    pub fn local(key: impl Into<String>) -> Self {
        NewJob {
            external_id: None,
            key: key.into(),
        }
    }
}

/// Row counts per partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: u64,
    pub local: u64,
    pub remote: u64,
    pub created: u64,
    pub in_work: u64,
    pub completed: u64,
    pub second_check: u64,
    pub error: u64,
}

impl StoreStats {
    fn record(&mut self, job: &Job) {
        self.total += 1;
        if job.external_id.is_some() {
            self.remote += 1;
        } else {
            self.local += 1;
        }

        let counter = match job.status {
            JobStatus::Created => &mut self.created,
            JobStatus::InWork => &mut self.in_work,
            JobStatus::Completed => &mut self.completed,
            JobStatus::SecondCheck => &mut self.second_check,
            JobStatus::Error => &mut self.error,
        };
        *counter += 1;
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    id: JobId,
    status: JobStatus,
}

impl IndexEntry {
    fn of(job: &Job) -> Self {
        IndexEntry {
            id: job.id,
            status: job.status,
        }
    }

    fn encode(&self) -> [u8; 9] {
        let mut bytes = [0u8; 9];
        bytes[..8].copy_from_slice(&self.id.to_be_bytes());
        bytes[8] = self.status.code();
        bytes
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 9 {
            return Err(PersistenceError::CorruptIndex(key.to_string()));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        let status = JobStatus::from_code(bytes[8])
            .map_err(|_| PersistenceError::CorruptIndex(key.to_string()))?;

        Ok(IndexEntry {
            id: u64::from_be_bytes(id),
            status,
        })
    }
}

/// Durable job queue using RocksDB
///
/// Jobs live in one column family per status, keyed by their big-endian id so
/// iteration follows insertion order. A separate index maps the unique business
/// key to the job's id and current status.
///
/// Every read-modify-write sequence runs under a single lock and commits as one
/// `WriteBatch`; an error anywhere in the sequence drops the batch untouched.
pub struct JobStore {
    db: DB,
    next_id: Mutex<JobId>,
}

impl JobStore {
    /// Open or create the job store
    pub fn open(config: JobStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let db_path = config.data_dir.join("jobs");

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let mut cf_descriptors: Vec<ColumnFamilyDescriptor> = JobStatus::ALL
            .iter()
            .map(|status| ColumnFamilyDescriptor::new(status.as_str(), Options::default()))
            .collect();
        cf_descriptors.push(ColumnFamilyDescriptor::new(CF_KEYS, Options::default()));
        cf_descriptors.push(ColumnFamilyDescriptor::new(CF_META, Options::default()));

        let db = DB::open_cf_descriptors(&db_opts, db_path, cf_descriptors)?;

        let next_id = {
            let meta = db
                .cf_handle(CF_META)
                .ok_or(PersistenceError::MissingColumnFamily(CF_META))?;
            match db.get_cf(meta, META_NEXT_ID)? {
                Some(bytes) if bytes.len() == 8 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&bytes);
                    u64::from_be_bytes(raw)
                }
                _ => 1,
            }
        };

        info!("Opened job store at {:?} (next id {})", config.data_dir, next_id);

        Ok(JobStore {
            db,
            next_id: Mutex::new(next_id),
        })
    }

    /// Insert new jobs with status `Created`.
    ///
    /// Keys already present in the store, or repeated within `items`, are
    /// skipped. Returns the number of rows actually inserted.
    pub fn insert_tasks(&self, items: &[NewJob]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        self.transact("insert_tasks", |batch, next_id| {
            let keys_cf = self.cf(CF_KEYS)?;
            let created_cf = self.cf(JobStatus::Created.as_str())?;

            let mut seen = HashSet::new();
            let mut inserted = 0;

            for item in items {
                if item.key.is_empty() {
                    warn!("Skipping task with an empty key");
                    continue;
                }
                if !seen.insert(item.key.as_str())
                    || self.db.get_cf(keys_cf, item.key.as_bytes())?.is_some()
                {
                    debug!(key = %item.key, "Duplicate key ignored");
                    continue;
                }

                let job = Job::new(*next_id, item.external_id, item.key.clone())?;
                batch.put_cf(created_cf, job.id.to_be_bytes(), job.to_bytes()?);
                batch.put_cf(keys_cf, job.key.as_bytes(), IndexEntry::of(&job).encode());

                *next_id += 1;
                inserted += 1;
            }

            Ok(inserted)
        })
    }

    /// Get a job by its business key
    pub fn get(&self, key: &str) -> Result<Option<Job>> {
        self.load(key)
    }

    /// Up to `limit` jobs waiting for the scan loop: all `Created` jobs
    /// first, then `SecondCheck`, each in insertion order
    pub fn next_actionable(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = self.scan(JobStatus::Created, limit)?;
        if jobs.len() < limit {
            let remaining = limit - jobs.len();
            jobs.extend(self.scan(JobStatus::SecondCheck, remaining)?);
        }
        Ok(jobs)
    }

    /// Move an actionable job to `InWork`.
    ///
    /// Returns `None` when the key is unknown or the job is no longer
    /// actionable (already picked by a concurrent scan).
    pub fn mark_in_work(&self, key: &str) -> Result<Option<Job>> {
        self.transact("mark_in_work", |batch, _| {
            let Some(mut job) = self.load(key)? else {
                return Ok(None);
            };
            if !job.status.is_actionable() {
                debug!(key, status = %job.status, "Job is not actionable, skipping");
                return Ok(None);
            }

            let from = job.status;
            job.start()?;
            self.stage_move(batch, from, &job)?;
            Ok(Some(job))
        })
    }

    /// Record the processor outcome for an `InWork` job and return its new status.
    ///
    /// A success whose payload is over the size limit is recorded as a failure.
    pub fn mark_outcome(&self, key: &str, outcome: JobOutcome) -> Result<Option<JobStatus>> {
        self.transact("mark_outcome", |batch, _| {
            let Some(mut job) = self.load(key)? else {
                warn!(key, "Outcome for unknown job dropped");
                return Ok(None);
            };

            let from = job.status;
            match job.finish(outcome) {
                Ok(()) => {}
                Err(JobError::PayloadTooLarge { max, actual }) => {
                    warn!(key, actual, max, "Payload too large, recording failure");
                    job.finish(JobOutcome::failure(format!(
                        "payload of {} bytes exceeds {} bytes",
                        actual, max
                    )))?;
                }
                Err(e) => return Err(e.into()),
            }

            self.stage_move(batch, from, &job)?;
            Ok(Some(job.status))
        })
    }

    /// Put a single `InWork` job back to the status it was picked from.
    ///
    /// Returns `false` when the job is unknown or not in work.
    pub fn release(&self, key: &str) -> Result<bool> {
        self.transact("release", |batch, _| {
            let Some(mut job) = self.load(key)? else {
                return Ok(false);
            };
            if job.status != JobStatus::InWork {
                return Ok(false);
            }

            job.release()?;
            self.stage_move(batch, JobStatus::InWork, &job)?;
            Ok(true)
        })
    }

    /// Up to `limit` finished jobs (`Completed` first, then `Error`)
    pub fn completed_batch(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = self.scan(JobStatus::Completed, limit)?;
        if jobs.len() < limit {
            let remaining = limit - jobs.len();
            jobs.extend(self.scan(JobStatus::Error, remaining)?);
        }
        Ok(jobs)
    }

    /// Remove shipped jobs. Only finished jobs are removed; anything else
    /// is left in place with a warning.
    pub fn delete_shipped(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        self.transact("delete_shipped", |batch, _| {
            let keys_cf = self.cf(CF_KEYS)?;
            let mut seen = HashSet::new();
            let mut deleted = 0;

            for key in keys {
                if !seen.insert(key.as_str()) {
                    continue;
                }
                let Some(entry) = self.index_entry(key)? else {
                    debug!(key = %key, "Shipped job already gone");
                    continue;
                };
                if !entry.status.is_terminal() {
                    warn!(key = %key, status = %entry.status, "Refusing to delete unfinished job");
                    continue;
                }

                batch.delete_cf(self.cf(entry.status.as_str())?, entry.id.to_be_bytes());
                batch.delete_cf(keys_cf, key.as_bytes());
                deleted += 1;
            }

            Ok(deleted)
        })
    }

    /// Release jobs left `InWork` by an interrupted run back to the
    /// status they were picked from
    pub fn recover_in_work(&self) -> Result<usize> {
        self.transact("recover_in_work", |batch, _| {
            let jobs = self.scan(JobStatus::InWork, usize::MAX)?;
            let count = jobs.len();

            for mut job in jobs {
                job.release()?;
                warn!(key = %job.key, status = %job.status, "Recovering interrupted job");
                self.stage_move(batch, JobStatus::InWork, &job)?;
            }

            Ok(count)
        })
    }

    /// Finished jobs that carry a payload
    pub fn jobs_with_payload(&self) -> Result<Vec<Job>> {
        Ok(self
            .scan(JobStatus::Completed, usize::MAX)?
            .into_iter()
            .filter(Job::has_payload)
            .collect())
    }

    /// Count jobs by status
    pub fn count_by_status(&self, status: JobStatus) -> Result<usize> {
        let cf = self.cf(status.as_str())?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for status in JobStatus::ALL {
            for job in self.scan(status, usize::MAX)? {
                stats.record(&job);
            }
        }
        Ok(stats)
    }

    /// Run `f` under the store lock and commit everything it staged as one batch
    fn transact<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut WriteBatch, &mut JobId) -> Result<T>,
    ) -> Result<T> {
        let mut next_id = self.next_id.lock();
        let mut batch = WriteBatch::default();
        let mut staged_id = *next_id;

        let result = match f(&mut batch, &mut staged_id) {
            Ok(value) => self.commit(batch, *next_id, staged_id).map(|_| value),
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => {
                *next_id = staged_id;
                Ok(value)
            }
            Err(e) => {
                error!(operation, "Job store transaction rolled back: {}", e);
                Err(e)
            }
        }
    }

    fn commit(&self, mut batch: WriteBatch, current_id: JobId, staged_id: JobId) -> Result<()> {
        if staged_id != current_id {
            batch.put_cf(self.cf(CF_META)?, META_NEXT_ID, staged_id.to_be_bytes());
        }
        if !batch.is_empty() {
            self.db.write(batch)?;
        }
        Ok(())
    }

    /// Stage moving `job` out of the `from` column family into the one for its current status
    fn stage_move(&self, batch: &mut WriteBatch, from: JobStatus, job: &Job) -> Result<()> {
        let key = job.id.to_be_bytes();
        batch.delete_cf(self.cf(from.as_str())?, key);
        batch.put_cf(self.cf(job.status.as_str())?, key, job.to_bytes()?);
        batch.put_cf(self.cf(CF_KEYS)?, job.key.as_bytes(), IndexEntry::of(job).encode());
        Ok(())
    }

    fn index_entry(&self, key: &str) -> Result<Option<IndexEntry>> {
        match self.db.get_cf(self.cf(CF_KEYS)?, key.as_bytes())? {
            Some(bytes) => IndexEntry::decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn load(&self, key: &str) -> Result<Option<Job>> {
        let Some(entry) = self.index_entry(key)? else {
            return Ok(None);
        };

        let cf = self.cf(entry.status.as_str())?;
        let bytes = self
            .db
            .get_cf(cf, entry.id.to_be_bytes())?
            .ok_or_else(|| PersistenceError::CorruptIndex(key.to_string()))?;

        Ok(Some(Job::from_bytes(&bytes)?))
    }

    fn scan(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
        let cf = self.cf(status.as_str())?;
        let mut jobs = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            if jobs.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            jobs.push(Job::from_bytes(&value)?);
        }

        Ok(jobs)
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or(PersistenceError::MissingColumnFamily(name))
    }
}

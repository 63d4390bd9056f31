// Copyright 2024 The DSI authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The shared progress record a client polls during `commit_chunk_*`. Lives
//! behind its own mutex, separate from the service's coarse lock, so
//! `get_install_progress` never blocks behind a long-running write (spec
//! §4.4/§5).

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum ProgressStatus {
    NoOperation = 0,
    Working = 1,
    Complete = 2,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Progress {
    pub step: String,
    pub status: ProgressStatus,
    pub processed: u64,
    pub total: u64,
}

impl Default for Progress {
    fn default() -> Self {
        Progress {
            step: String::new(),
            status: ProgressStatus::NoOperation,
            processed: 0,
            total: 0,
        }
    }
}

/// A `Progress` behind its own mutex. Readers and the single writer never
/// see a torn record: the mutex guard is held only for the duration of an
/// atomic field assignment or a snapshot clone.
#[derive(Debug, Default)]
pub struct ProgressRecord(Mutex<Progress>);

impl ProgressRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Progress {
        self.0.lock().expect("progress mutex poisoned").clone()
    }

    pub fn start(&self, step: &str, total: u64) {
        let mut p = self.0.lock().expect("progress mutex poisoned");
        p.step = step.to_string();
        p.status = ProgressStatus::Working;
        p.processed = 0;
        p.total = total;
    }

    pub fn update(&self, processed: u64) {
        let mut p = self.0.lock().expect("progress mutex poisoned");
        p.processed = processed;
    }

    pub fn complete(&self) {
        let mut p = self.0.lock().expect("progress mutex poisoned");
        p.status = ProgressStatus::Complete;
        p.processed = p.total;
    }

    pub fn reset(&self) {
        let mut p = self.0.lock().expect("progress mutex poisoned");
        *p = Progress::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lifecycle() {
        let record = ProgressRecord::new();
        assert_eq!(record.snapshot().status, ProgressStatus::NoOperation);

        record.start("write gsi", 100);
        let snap = record.snapshot();
        assert_eq!(snap.status, ProgressStatus::Working);
        assert_eq!(snap.total, 100);
        assert_eq!(snap.processed, 0);

        record.update(50);
        assert_eq!(record.snapshot().processed, 50);

        record.complete();
        let snap = record.snapshot();
        assert_eq!(snap.status, ProgressStatus::Complete);
        assert_eq!(snap.processed, snap.total);
    }

    #[test]
    fn concurrent_reads_during_write_never_see_inconsistent_totals() {
        use std::sync::Arc;
        use std::thread;

        let record = Arc::new(ProgressRecord::new());
        record.start("write gsi", 1_000_000);
        let writer = {
            let record = Arc::clone(&record);
            thread::spawn(move || {
                for i in 0..1000 {
                    record.update(i * 1000);
                }
                record.complete();
            })
        };
        for _ in 0..1000 {
            let snap = record.snapshot();
            assert!(snap.processed <= snap.total);
        }
        writer.join().unwrap();
    }
}

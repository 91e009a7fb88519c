use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use cascade_match::catalog::{CatalogItem, Idx};
use cascade_match::embedder::{BatchEmbedder, EmbedderArgs};
use cascade_match::index::shard::write_shard;
use cascade_match::telemetry::init_tracing;
use clap::Parser;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "catalog-embedder",
    about = "Embed catalog records into numbered .npy shards for match-api"
)]
struct EmbedCli {
    /// Catalog JSONL with one record per line
    #[arg(long, env = "CASCADE_CATALOG_JSONL", default_value = "catalog.jsonl")]
    input: PathBuf,

    /// Directory receiving embeddings_batch_<n>.npy / indices_batch_<n>.npy pairs
    #[arg(long, env = "CASCADE_EMBEDDINGS_DIR", default_value = "embeddings")]
    output_dir: PathBuf,

    /// Rows per shard file
    #[arg(long, default_value_t = 10_000)]
    shard_size: usize,

    /// Number given to the first shard written (lets runs append to a directory)
    #[arg(long, default_value_t = 1)]
    first_shard: u64,

    /// Number of concurrent embedding workers
    #[arg(long, env = "CASCADE_EMBED_THREADS", default_value_t = 1)]
    worker_threads: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "CASCADE_LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

fn main() -> Result<()> {
    let cli = EmbedCli::parse();
    init_tracing(cli.log_json);
    let embedder = cli.embedder.build()?;
    let input =
        File::open(&cli.input).with_context(|| format!("failed to open {:?}", cli.input))?;
    fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("failed to create {:?}", cli.output_dir))?;

    let summary = process_stream(
        BufReader::new(input),
        embedder,
        &ShardSink::new(&cli.output_dir, cli.first_shard, cli.shard_size),
        cli.worker_threads,
    )?;
    info!(
        embedded = summary.embedded,
        skipped = summary.skipped,
        shards = summary.shards,
        dir = %cli.output_dir.display(),
        "embedding complete"
    );
    if summary.embedded == 0 {
        warn!("no catalog records had embeddable text");
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    embedded: usize,
    skipped: usize,
    shards: usize,
}

/// Destination directory and shard numbering.
struct ShardSink {
    dir: PathBuf,
    first: u64,
    rows_per_shard: usize,
}

impl ShardSink {
    fn new(dir: &Path, first: u64, rows_per_shard: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            first,
            rows_per_shard: rows_per_shard.max(1),
        }
    }
}

/// Buffers embedded rows in input order and writes full shards.
struct ShardWriter<'a> {
    sink: &'a ShardSink,
    rows: Vec<(Idx, Vec<f32>)>,
    written: usize,
}

impl<'a> ShardWriter<'a> {
    fn new(sink: &'a ShardSink) -> Self {
        Self {
            sink,
            rows: Vec::with_capacity(sink.rows_per_shard),
            written: 0,
        }
    }

    fn push(&mut self, rows: Vec<(Idx, Vec<f32>)>) -> Result<()> {
        self.rows.extend(rows);
        while self.rows.len() >= self.sink.rows_per_shard {
            let rest = self.rows.split_off(self.sink.rows_per_shard);
            let full = std::mem::replace(&mut self.rows, rest);
            self.write(&full)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<usize> {
        if !self.rows.is_empty() {
            let rows = std::mem::take(&mut self.rows);
            self.write(&rows)?;
        }
        Ok(self.written)
    }

    fn write(&mut self, rows: &[(Idx, Vec<f32>)]) -> Result<()> {
        let number = self.sink.first + self.written as u64;
        let paths = write_shard(&self.sink.dir, number, rows)?;
        self.written += 1;
        info!(
            shard = number,
            rows = rows.len(),
            path = %paths.embeddings.display(),
            "wrote shard"
        );
        Ok(())
    }
}

fn process_stream<R: BufRead>(
    reader: R,
    embedder: Arc<dyn BatchEmbedder>,
    sink: &ShardSink,
    worker_threads: usize,
) -> Result<Summary> {
    let worker_threads = worker_threads.max(1);
    let batch_size = embedder.batch_size().max(1);
    info!(batch_size, workers = worker_threads, "launching catalog embedder");
    let (task_tx, task_rx) = bounded::<EmbeddingTask>(worker_threads * 2);
    // workers must never block on results while the reader blocks on tasks
    let (result_tx, result_rx) = unbounded::<EmbeddingResult>();

    let mut workers = Vec::with_capacity(worker_threads);
    for worker_id in 0..worker_threads {
        let worker_embedder = embedder.clone();
        let worker_rx = task_rx.clone();
        let worker_tx = result_tx.clone();
        workers.push(thread::spawn(move || {
            worker_loop(worker_id, worker_rx, worker_tx, worker_embedder)
        }));
    }
    drop(task_rx);
    drop(result_tx);

    let mut writer = ShardWriter::new(sink);
    let mut summary = Summary::default();
    let mut pending: Vec<(Idx, String)> = Vec::with_capacity(batch_size);
    let mut reorder = Reorder::default();
    let mut next_batch_id = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let item: CatalogItem = serde_json::from_str(&line)
            .with_context(|| format!("invalid catalog record at line {}", line_no + 1))?;
        let text = item.embedding_text();
        if text.trim().is_empty() {
            debug!(idx = item.idx, "skipping record without title, description or skills");
            summary.skipped += 1;
            continue;
        }
        pending.push((item.idx, text));
        if pending.len() >= batch_size {
            dispatch_batch(&mut pending, &mut next_batch_id, &mut reorder, &task_tx)?;
            while let Some(result) = try_next(&result_rx)? {
                reorder.accept(result?, &mut writer, &mut summary)?;
            }
        }
    }
    dispatch_batch(&mut pending, &mut next_batch_id, &mut reorder, &task_tx)?;
    drop(task_tx);

    while reorder.inflight > 0 {
        let result = match result_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => {
                info!(
                    inflight = reorder.inflight,
                    oldest = reorder.next_id,
                    "waiting on embedding batches"
                );
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                bail!("embedding worker channel closed unexpectedly")
            }
        };
        reorder.accept(result?, &mut writer, &mut summary)?;
    }
    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow!("embedding worker panicked"))?;
    }
    summary.shards = writer.finish()?;
    Ok(summary)
}

fn try_next(receiver: &Receiver<EmbeddingResult>) -> Result<Option<EmbeddingResult>> {
    match receiver.try_recv() {
        Ok(result) => Ok(Some(result)),
        Err(TryRecvError::Empty) => Ok(None),
        Err(TryRecvError::Disconnected) => bail!("embedding worker channel closed unexpectedly"),
    }
}

fn dispatch_batch(
    pending: &mut Vec<(Idx, String)>,
    next_batch_id: &mut usize,
    reorder: &mut Reorder,
    sender: &Sender<EmbeddingTask>,
) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let records = std::mem::take(pending);
    debug!(batch = *next_batch_id, records = records.len(), "queued embedding batch");
    let task = EmbeddingTask {
        id: *next_batch_id,
        records,
    };
    *next_batch_id += 1;
    reorder.inflight += 1;
    sender
        .send(task)
        .map_err(|_| anyhow!("embedding worker channel closed"))
}

/// Releases finished batches to the shard writer in dispatch order.
#[derive(Default)]
struct Reorder {
    ready: BTreeMap<usize, Vec<(Idx, Vec<f32>)>>,
    next_id: usize,
    inflight: usize,
}

impl Reorder {
    fn accept(
        &mut self,
        batch: EmbeddedBatch,
        writer: &mut ShardWriter<'_>,
        summary: &mut Summary,
    ) -> Result<()> {
        self.inflight = self.inflight.saturating_sub(1);
        self.ready.insert(batch.id, batch.rows);
        while let Some(rows) = self.ready.remove(&self.next_id) {
            summary.embedded += rows.len();
            writer.push(rows)?;
            self.next_id += 1;
        }
        Ok(())
    }
}

fn worker_loop(
    worker_id: usize,
    receiver: Receiver<EmbeddingTask>,
    sender: Sender<EmbeddingResult>,
    embedder: Arc<dyn BatchEmbedder>,
) {
    for task in receiver.iter() {
        let batch_id = task.id;
        let count = task.records.len();
        debug!(worker = worker_id, batch = batch_id, records = count, "embedding batch");
        let result = embed_records(embedder.as_ref(), task).map_err(|err| {
            anyhow!("worker {worker_id} failed batch {batch_id} ({count} records): {err:#}")
        });
        if sender.send(result).is_err() {
            break;
        }
    }
}

fn embed_records(embedder: &dyn BatchEmbedder, task: EmbeddingTask) -> Result<EmbeddedBatch> {
    let inputs: Vec<&str> = task.records.iter().map(|(_, text)| text.as_str()).collect();
    let embeddings = embedder.embed_batch(&inputs)?;
    anyhow::ensure!(
        embeddings.len() == task.records.len(),
        "embedding count {} mismatched pending {}",
        embeddings.len(),
        task.records.len()
    );
    let rows = task
        .records
        .into_iter()
        .map(|(idx, _)| idx)
        .zip(embeddings)
        .collect();
    Ok(EmbeddedBatch { id: task.id, rows })
}

struct EmbeddingTask {
    id: usize,
    records: Vec<(Idx, String)>,
}

struct EmbeddedBatch {
    id: usize,
    rows: Vec<(Idx, Vec<f32>)>,
}

type EmbeddingResult = Result<EmbeddedBatch>;

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_match::index::{EmbeddingIndex, HnswConfig};
    use cascade_match::vector::UnitVector;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    /// Maps text length onto a 2-d vector so neighbours are predictable.
    struct LengthEmbedder {
        batch: usize,
    }

    impl BatchEmbedder for LengthEmbedder {
        fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs
                .iter()
                .map(|text| vec![text.len() as f32, 1.0])
                .collect())
        }

        fn batch_size(&self) -> usize {
            self.batch
        }
    }

    struct Broken;

    impl BatchEmbedder for Broken {
        fn embed_batch(&self, _inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            bail!("embedding service unavailable")
        }

        fn batch_size(&self) -> usize {
            2
        }
    }

    fn catalog_lines() -> String {
        [
            r#"{"idx": 7, "title": "Auditor"}"#,
            "",
            r#"{"idx": 3, "title": "Senior Auditor", "description": "Big four"}"#,
            r#"{"idx": 9, "title": ""}"#,
            r#"{"idx": 1, "title": "Tax consultant", "key_skills": "VAT"}"#,
            r#"{"idx": 4, "title": "CFO"}"#,
        ]
        .join("\n")
    }

    #[test]
    fn writes_shards_that_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ShardSink::new(dir.path(), 5, 3);
        let summary = process_stream(
            Cursor::new(catalog_lines()),
            Arc::new(LengthEmbedder { batch: 2 }),
            &sink,
            3,
        )
        .unwrap();
        assert_eq!(
            summary,
            Summary {
                embedded: 4,
                skipped: 1,
                shards: 2,
            }
        );
        assert!(dir.path().join("embeddings_batch_5.npy").exists());
        assert!(dir.path().join("indices_batch_6.npy").exists());

        let index = EmbeddingIndex::build_from_dir(dir.path(), HnswConfig::default()).unwrap();
        assert_eq!(index.len(), 4);
        let query = UnitVector::normalize(vec!["CFO".len() as f32, 1.0]).unwrap();
        assert_eq!(index.search(&query, 1).unwrap()[0].idx, 4);
        let everything = index.search(&query, 10).unwrap();
        assert_eq!(everything.len(), 4);
        assert!(everything.iter().all(|hit| hit.idx != 9));
    }

    #[test]
    fn worker_failure_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ShardSink::new(dir.path(), 0, 10);
        let err = process_stream(Cursor::new(catalog_lines()), Arc::new(Broken), &sink, 1)
            .unwrap_err();
        assert!(format!("{err:#}").contains("embedding service unavailable"));
    }

    #[test]
    fn invalid_json_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ShardSink::new(dir.path(), 0, 10);
        let err = process_stream(
            Cursor::new("{\"idx\": 1, \"title\": \"A\"}\nnot json"),
            Arc::new(LengthEmbedder { batch: 4 }),
            &sink,
            1,
        )
        .unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}

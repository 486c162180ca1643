//! Report rendering: a human-readable text block and a JSON line.
//!
//! Text goes to the reporter's output stream; JSON is appended one object
//! per line to an optional file, with a trailing newline so the file is
//! valid JSON-lines. Field names are an external contract (tools parse
//! them) and change only with the format version.

use super::{ReportKind, ReportView, ThreadMetricsSnapshot};

use serde::Serialize;

use std::io::{self, Write};

/// Writes the text form:
///
/// ```text
/// [metrics][periodic] ts=… total_events=… dropped=… filtered=… bytes=… active_threads=… eps=0.00 bps=0.00 window_ns=…
///   thread=… slot=… events=… dropped=… filtered=… bytes=… eps=0.00 bps=0.00 drop%=0.00 swaps=… swaps_per_s=0.00 avg_swap_ns=…
/// ```
pub fn write_text(view: &ReportView<'_>, out: &mut dyn Write) -> io::Result<()> {
    writeln!(
        out,
        "[metrics][{}] ts={} total_events={} dropped={} filtered={} bytes={} \
         active_threads={} eps={:.2} bps={:.2} window_ns={}",
        view.kind.label(),
        view.timestamp_ns,
        view.totals.total_events_written,
        view.totals.total_events_dropped,
        view.totals.total_events_filtered,
        view.totals.total_bytes_written,
        view.totals.active_thread_count,
        view.rates.system_events_per_second,
        view.rates.system_bytes_per_second,
        view.rates.last_window_ns,
    )?;

    for snap in view.snapshots {
        write_thread_text_line(snap, out)?;
    }
    out.flush()
}

fn write_thread_text_line(snap: &ThreadMetricsSnapshot, out: &mut dyn Write) -> io::Result<()> {
    writeln!(
        out,
        "  thread={} slot={} events={} dropped={} filtered={} bytes={} eps={:.2} \
         bps={:.2} drop%={:.2} swaps={} swaps_per_s={:.2} avg_swap_ns={}",
        snap.thread_id,
        snap.slot_index,
        snap.events_written,
        snap.events_dropped,
        snap.events_filtered,
        snap.bytes_written,
        snap.events_per_second,
        snap.bytes_per_second,
        snap.drop_rate_percent,
        snap.swap_count,
        snap.swaps_per_second,
        snap.avg_swap_duration_ns,
    )
}

#[derive(Serialize)]
struct ReportJson<'a> {
    kind: &'a str,
    timestamp_ns: u64,
    totals: TotalsJson,
    rates: RatesJson,
    threads: Vec<ThreadJson>,
}

#[derive(Serialize)]
struct TotalsJson {
    events_written: u64,
    events_dropped: u64,
    events_filtered: u64,
    bytes_written: u64,
    active_threads: u32,
}

#[derive(Serialize)]
struct RatesJson {
    events_per_second: f64,
    bytes_per_second: f64,
    window_ns: u64,
}

#[derive(Serialize)]
struct ThreadJson {
    thread_id: u32,
    slot_index: u32,
    events_written: u64,
    events_dropped: u64,
    events_filtered: u64,
    bytes_written: u64,
    events_per_second: f64,
    bytes_per_second: f64,
    drop_rate_percent: f64,
    swap_count: u64,
    swaps_per_second: f64,
    avg_swap_duration_ns: u64,
    max_queue_depth: u32,
}

/// Writes the JSON form as one object terminated by a newline.
///
/// An empty snapshot list renders as `"threads":[]`.
pub fn write_json(view: &ReportView<'_>, out: &mut dyn Write) -> io::Result<()> {
    let doc = ReportJson {
        kind: view.kind.label(),
        timestamp_ns: view.timestamp_ns,
        totals: TotalsJson {
            events_written: view.totals.total_events_written,
            events_dropped: view.totals.total_events_dropped,
            events_filtered: view.totals.total_events_filtered,
            bytes_written: view.totals.total_bytes_written,
            active_threads: view.totals.active_thread_count,
        },
        rates: RatesJson {
            events_per_second: view.rates.system_events_per_second,
            bytes_per_second: view.rates.system_bytes_per_second,
            window_ns: view.rates.last_window_ns,
        },
        threads: view
            .snapshots
            .iter()
            .map(|snap| ThreadJson {
                thread_id: snap.thread_id,
                slot_index: snap.slot_index,
                events_written: snap.events_written,
                events_dropped: snap.events_dropped,
                events_filtered: snap.events_filtered,
                bytes_written: snap.bytes_written,
                events_per_second: snap.events_per_second,
                bytes_per_second: snap.bytes_per_second,
                drop_rate_percent: snap.drop_rate_percent,
                swap_count: snap.swap_count,
                swaps_per_second: snap.swaps_per_second,
                avg_swap_duration_ns: snap.avg_swap_duration_ns,
                max_queue_depth: snap.max_queue_depth,
            })
            .collect(),
    };

    serde_json::to_writer(&mut *out, &doc)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    out.write_all(b"\n")?;
    out.flush()
}

use std::io;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::model::Event;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

type Pending = (Event, oneshot::Sender<io::Result<()>>);

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL and group-commits appends: wait for one append, drain
/// whatever else is already queued, then fsync once for the whole group.
/// A non-append command ends the group; the group is flushed before the
/// command runs so ordering is preserved.
pub(super) async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut group: Vec<Pending> = vec![(event, response)];
        let mut trailing = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => group.push((event, response)),
                other => {
                    trailing = Some(other);
                    break;
                }
            }
        }

        flush_group(&mut wal, group);
        if let Some(cmd) = trailing {
            handle_control(&mut wal, cmd);
        }
    }
}

fn flush_group(wal: &mut Wal, group: Vec<Pending>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(group.len() as f64);
    let started = Instant::now();

    let result = group
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        // Callers are about to be told the group failed, so none of it may
        // survive into the file.
        error!("WAL group of {} events failed: {e}", group.len());
        if let Err(rollback) = wal.rollback() {
            error!("WAL rollback failed, refusing further appends: {rollback}");
        }
    }
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, tx) in group {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => flush_group(wal, vec![(event, response)]),
    }
}

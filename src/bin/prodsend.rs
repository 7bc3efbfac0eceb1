use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use prodlink::cli::{program_name, SendArgs};
use prodlink::control::{self, Control};
use prodlink::fsutil::PidFile;
use prodlink::logger::{LogFile, LogOptions, RecordSink};
use prodlink::queue::{InputQueue, Outbox, OutboxOptions, QueueOptions};
use prodlink::sender::{Sender, SenderOptions};
use prodlink::stats::StatsWriter;

// exit codes: 0 ok, 1 args, 2 init, 3 run failure, 4 shutdown;
// 3 and 4 compose when a failing run was also asked to shut down
fn main() -> ExitCode {
    let args = SendArgs::parse();
    if let Err(e) = args.validate() {
        eprintln!("{}: {:#}", program_name(), e);
        return ExitCode::from(1);
    }
    run(args)
}

fn run(args: SendArgs) -> ExitCode {
    let mut program = program_name();
    if let Some(source) = &args.source {
        program = format!("{}-{}", program, source);
    }

    if let Err(e) = control::install_terminate_handlers() {
        eprintln!("{}: {:#}", program, e);
        return ExitCode::from(2);
    }
    let ctl = Control::process();

    let (hosts, port) = args.resolve_hosts();
    let (indirs, sent_dir, fail_dir) = match args.resolve_dirs() {
        Ok(dirs) => dirs,
        Err(e) => {
            eprintln!("{}: {:#}", program, e);
            return ExitCode::from(2);
        }
    };

    let log_options = LogOptions {
        dir: args.log_dir.clone().unwrap_or_default(),
        archive: args.archive_logs,
        echo: args.debug,
        max_size: 0,
    };
    let logfile = match LogFile::open(&program, &log_options) {
        Ok(logfile) => logfile,
        Err(e) => {
            eprintln!("{}: {:#}", program, e);
            return ExitCode::from(2);
        }
    };
    let stats_path = logfile
        .path()
        .with_file_name(format!("{}-stats.json", program));
    let sink: Arc<dyn RecordSink> = Arc::new(logfile);

    let pidfile_path = format!("/var/run/{}-{}-{}", program, hosts[0], port);
    let pidfile = match PidFile::write(Path::new(&pidfile_path)) {
        Ok(pidfile) => Some(pidfile),
        Err(e) => {
            sink.error(&format!("{:#}", e));
            None
        }
    };

    let indir_label = match indirs.len() {
        1 => indirs[0].display().to_string(),
        _ => format!("{},...", indirs[0].display()),
    };

    sink.product(&format!(
        "STATUS START [{}] pid({}) {} to={}/{} dir({})",
        program,
        std::process::id(),
        args.source.as_deref().unwrap_or("unknown"),
        hosts[0],
        port,
        indir_label,
    ));

    let queue = InputQueue::new(
        QueueOptions {
            indirs,
            refresh_interval: args.refresh_interval,
            max_queue_len: if args.max_queue_len > 0 {
                args.max_queue_len as usize
            } else {
                0
            },
            wait_last_file: args.wait_last_file,
            verbosity: args.verbosity,
        },
        sink.clone(),
    );

    let outbox = Outbox::new(
        OutboxOptions {
            sent_dir,
            fail_dir,
            sent_count: args.sent_count,
            queue_ttl: args.queue_ttl.unwrap_or(0),
            verbosity: args.verbosity,
        },
        sink.clone(),
    );

    let stats = (args.shm_region >= 0)
        .then(|| StatsWriter::create(stats_path, args.shm_region, args.link_id, args.host_id));

    let options = SenderOptions {
        port,
        hosts: hosts.clone(),
        timeout: args.timeout,
        poll_interval: args.poll_interval,
        queue_ttl: args.queue_ttl.unwrap_or(0),
        max_retry: args.max_retry,
        bufsize: args.bufsize,
        connect_wmo: args.connect_wmo.clone(),
        source: args.source.clone(),
        strip_ccb: args.strip_ccb,
        verbosity: args.verbosity,
        program: program.clone(),
        link_id: args.link_id,
        host_id: args.host_id,
        shm_region: args.shm_region,
        indir_label: indir_label.clone(),
    };

    let mut sender = Sender::new(
        options,
        args.window_size,
        ctl.clone(),
        sink.clone(),
        queue,
        outbox,
        stats,
    );

    let mut status: u8 = match sender.run() {
        Ok(()) => 0,
        Err(e) => {
            sink.error(&format!("send loop failed: {:#}", e));
            3
        }
    };
    if ctl.shutdown() {
        status |= 4;
    }

    sink.product(&format!(
        "STATUS EXIT {} [{}] pid({}) {} to={}/{} dir({})",
        status,
        program,
        std::process::id(),
        args.source.as_deref().unwrap_or("unknown"),
        hosts[0],
        port,
        indir_label,
    ));
    sink.flush();
    drop(pidfile);

    ExitCode::from(status)
}

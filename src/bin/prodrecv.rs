use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use prodlink::cli::{program_name, RecvArgs};
use prodlink::control::{self, Control};
use prodlink::dispatch::{DispatchOptions, Dispatcher, WorkerSpec};
use prodlink::fsutil::{self, PidFile};
use prodlink::logger::{LogFile, LogOptions, NoopSink, RecordSink};
use prodlink::receiver::ReceiverOptions;
use prodlink::store::FileStore;

// exit codes: 0 ok, 1 args, 2 init, 3 run failure, 4 shutdown;
// a failing dispatcher under shutdown composes both as 7
fn main() -> ExitCode {
    let args = RecvArgs::parse();
    if let Err(e) = args.validate() {
        eprintln!("{}: {:#}", program_name(), e);
        return ExitCode::from(1);
    }
    run(args)
}

fn run(args: RecvArgs) -> ExitCode {
    let mut program = program_name();
    if let Some(source) = &args.source {
        program = format!("{}-{}", program, source);
    }

    if let Err(e) = control::install_terminate_handlers() {
        eprintln!("{}: {:#}", program, e);
        return ExitCode::from(2);
    }
    let ctl = Control::process();

    let outdir = match args.resolve_outdir().and_then(|dir| {
        fsutil::make_dirs(&dir)?;
        Ok(dir)
    }) {
        Ok(dir) => dir,
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
    let sink: Arc<dyn RecordSink> = match LogFile::open(&program, &log_options) {
        Ok(logfile) => Arc::new(logfile),
        Err(e) => {
            eprintln!("{}: {:#}", program, e);
            return ExitCode::from(2);
        }
    };

    let pidfile_path = format!("/var/run/{}-{}", program, args.port);
    let pidfile = match PidFile::write(Path::new(&pidfile_path)) {
        Ok(pidfile) => Some(pidfile),
        Err(e) => {
            sink.error(&format!("{:#}", e));
            None
        }
    };

    sink.debug(&format!(
        "starting dispatcher pid={} on port {}",
        std::process::id(),
        args.port
    ));

    let store = Arc::new(FileStore::new(
        outdir,
        &program,
        args.verbosity,
        sink.clone(),
    ));

    let worker_log_options = log_options.clone();
    let sink_factory = Arc::new(move |name: &str| -> Arc<dyn RecordSink> {
        match LogFile::open(name, &worker_log_options) {
            Ok(logfile) => Arc::new(logfile),
            Err(e) => {
                eprintln!("{}: {:#}", name, e);
                Arc::new(NoopSink)
            }
        }
    });

    let spec = WorkerSpec {
        recv_opt: ReceiverOptions {
            timeout: args.timeout,
            bufsize: args.bufsize,
            verbosity: args.verbosity,
            connect_wmo: args.connect_wmo.clone(),
            toggle_perms: args.toggle_perms,
            overwrite: args.overwrite,
        },
        store,
        program: program.clone(),
        sink_factory,
    };

    let mut dispatcher = Dispatcher::new(
        DispatchOptions {
            listen_port: args.port,
            max_worker: args.max_worker,
            verbosity: args.verbosity,
        },
        ctl.clone(),
        sink.clone(),
        spec,
    );

    let mut status: u8 = match dispatcher.run() {
        Ok(()) => 0,
        Err(e) => {
            sink.error(&format!("dispatcher failed: {:#}", e));
            3
        }
    };
    if ctl.shutdown() {
        status |= 4;
    }

    sink.debug(&format!(
        "dispatcher pid={} exiting with status {}",
        std::process::id(),
        status
    ));
    sink.flush();
    drop(pidfile);

    ExitCode::from(status)
}

// SPDX-License-Identifier: Apache-2.0
/*
 * BMC-side PLDM file-I/O daemon.
 */

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use argh::FromArgs;
use log::{info, warn};

use pldm_fileio::filetable::FileTable;
use pldm_fileio::PLDM_TYPE_OEM;
use pldm_fileiod::handler::{FileIoHandler, HandlerConfig};
use pldm_fileiod::notifier::HostNotifier;
use pldm_fileiod::reactor::Reactor;
use pldm_fileiod::transport::{
    HostLink, MctpAddr, MctpRequester, ResponseSink,
};
use pldm_fileiod::watch;

fn default_file_table() -> PathBuf {
    PathBuf::from("/var/lib/pldm/fileTable.json")
}

fn default_staging() -> PathBuf {
    PathBuf::from("/var/lib/pldm")
}

fn default_device() -> PathBuf {
    PathBuf::from(xdma::XDMA_DEV)
}

#[derive(FromArgs, Debug)]
#[argh(description = "PLDM file-I/O responder")]
struct Args {
    /// disable all transfer deadline enforcement
    #[argh(switch, short = 't')]
    notimeout: bool,

    /// debug logging
    #[argh(switch, short = 'd')]
    debug: bool,

    /// trace logging
    #[argh(switch)]
    trace: bool,

    /// host endpoint id
    #[argh(option, default = "9")]
    host_eid: u8,

    /// MCTP network of the host endpoint
    #[argh(option, default = "0")]
    host_net: u32,

    /// file table listing
    #[argh(option, default = "default_file_table()")]
    file_table: PathBuf,

    /// staging root for by-type files
    #[argh(option, default = "default_staging()")]
    staging: PathBuf,

    /// DMA device node
    #[argh(option, default = "default_device()")]
    device: PathBuf,
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let level = if args.trace {
        "trace"
    } else if args.debug {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level),
    )
    .init();

    if args.notimeout {
        info!("transfer deadlines disabled");
    }

    let table = match FileTable::load(&args.file_table) {
        Ok(t) => t,
        Err(e) => {
            warn!("file table unavailable: {e}");
            FileTable::default()
        }
    };

    let reactor = Rc::new(Reactor::new());
    let link =
        Rc::new(HostLink::new().context("cannot bind the PLDM listener")?);
    let handler = FileIoHandler::new(
        table,
        HandlerConfig {
            device: args.device,
            staging: args.staging.clone(),
            no_timeout: args.notimeout,
        },
        reactor.clone(),
        link.clone(),
    );

    let notifier = MctpRequester::new(MctpAddr {
        net: args.host_net,
        eid: args.host_eid,
    })
    .map(|r| Rc::new(HostNotifier::new(r, &reactor)));

    info!("serving PLDM file-I/O, host eid {}", args.host_eid);

    reactor.clone().block_on(async {
        match notifier {
            Ok(n) => {
                if let Err(e) =
                    watch::attach(&reactor, n, args.staging.clone()).await
                {
                    warn!("bus watches unavailable: {e}");
                }
            }
            Err(e) => warn!("host notifier unavailable: {e}"),
        }

        let mut buf = [0u8; 4096];
        loop {
            let (req, key) = link
                .recv_request(&mut buf)
                .await
                .context("PLDM receive failed")?;
            if req.typ != PLDM_TYPE_OEM {
                warn!("unexpected PLDM type {:#04x}", req.typ);
                continue;
            }
            if let Some(resp) = handler.dispatch(&req, key) {
                if let Err(e) = link.send_response(&key, &resp) {
                    warn!(
                        "response for cmd {:#04x} iid {} not sent: {e}",
                        resp.cmd, resp.iid
                    );
                }
            }
        }
    })
}

// SPDX-License-Identifier: Apache-2.0

//! Message-bus signal watches.
//!
//! Translates system events into host notifications: a new resource dump
//! entry, a certificate signing request, or a license activation each
//! stage a file and raise NewFileAvailable through the [`HostNotifier`].
//! The bus is attached to the reactor exactly once at startup.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use log::{info, warn};
use smol::stream::StreamExt;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue};
use zbus::{Connection, MatchRule, MessageStream};

use pldm_fileio::proto::file_type;

use crate::notifier::{HostNotifier, NotifyError};
use crate::reactor::Reactor;

const DUMP_PATH: &str = "/xyz/openbmc_project/dump";
const RES_DUMP_ENTRY: &str = "com.ibm.Dump.Entry.Resource";
const CERT_PATH: &str = "/xyz/openbmc_project/certs/ca";
const CSR_IFACE: &str =
    "xyz.openbmc_project.PLDM.Provider.Certs.Authority.CSR";
const LICENSE_PATH: &str = "/com/ibm/license";
const LICENSE_IFACE: &str = "com.ibm.License.LicenseManager";

type InterfaceProps = HashMap<String, HashMap<String, OwnedValue>>;

/// Connects to the system bus, attaches it to the reactor and spawns the
/// signal watches. A missing bus is the caller's problem to tolerate.
pub async fn attach(
    reactor: &Reactor,
    notifier: Rc<HostNotifier>,
    staging: PathBuf,
) -> zbus::Result<()> {
    let conn = Connection::system().await?;
    if !reactor.attach_bus(conn.clone()) {
        return Ok(());
    }
    reactor
        .spawn(watch_resource_dumps(
            conn.clone(),
            notifier.clone(),
            staging.clone(),
        ))
        .detach();
    reactor
        .spawn(watch_csrs(conn.clone(), notifier.clone(), staging.clone()))
        .detach();
    reactor.spawn(watch_licenses(conn, notifier, staging)).detach();
    info!("bus watches attached");
    Ok(())
}

/// Trailing object-path segment as a numeric entry id.
fn entry_id(path: &ObjectPath) -> u32 {
    path.as_str()
        .rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn value_str(v: &OwnedValue) -> Option<String> {
    v.downcast_ref::<&str>().ok().map(str::to_string)
}

fn notify(result: Result<(), NotifyError>, what: &str) {
    if let Err(e) = result {
        warn!("host notification for {what} failed: {e}");
    }
}

async fn watch_resource_dumps(
    conn: Connection,
    notifier: Rc<HostNotifier>,
    staging: PathBuf,
) {
    let run = async {
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface("org.freedesktop.DBus.ObjectManager")?
            .member("InterfacesAdded")?
            .path_namespace(DUMP_PATH)?
            .build();
        let mut stream = MessageStream::for_match_rule(rule, &conn, None).await?;
        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    warn!("dump watch stream error: {e}");
                    continue;
                }
            };
            let Ok((path, ifaces)) = msg
                .body()
                .deserialize::<(OwnedObjectPath, InterfaceProps)>()
            else {
                continue;
            };
            let Some(props) = ifaces.get(RES_DUMP_ENTRY) else {
                continue;
            };
            let vsp = props.get("VSPString").and_then(value_str);
            let password = props.get("Password").and_then(value_str);
            let (Some(vsp), Some(password)) = (vsp, password) else {
                continue;
            };
            let id = entry_id(&path);
            let parms = staging
                .join("dumps/resource")
                .join(format!("parms.{id}"));
            let contents = format!("{vsp}\n{password}\n");
            if let Some(dir) = parms.parent() {
                if let Err(e) = fs::create_dir_all(dir) {
                    warn!("dump staging dir failed: {e}");
                    continue;
                }
            }
            if let Err(e) = fs::write(&parms, &contents) {
                warn!("dump parameter file {} failed: {e}", parms.display());
                continue;
            }
            info!("resource dump {id} requested");
            notify(
                notifier
                    .new_file_available(
                        file_type::RESOURCE_DUMP_PARMS,
                        id,
                        contents.len() as u64,
                    )
                    .await,
                "resource dump parameters",
            );
        }
        Ok::<(), zbus::Error>(())
    };
    if let Err(e) = run.await {
        warn!("resource dump watch ended: {e}");
    }
}

async fn watch_csrs(
    conn: Connection,
    notifier: Rc<HostNotifier>,
    staging: PathBuf,
) {
    let run = async {
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface("org.freedesktop.DBus.ObjectManager")?
            .member("InterfacesAdded")?
            .path_namespace(CERT_PATH)?
            .build();
        let mut stream = MessageStream::for_match_rule(rule, &conn, None).await?;
        while let Some(msg) = stream.next().await {
            let Ok(msg) = msg else { continue };
            let Ok((path, ifaces)) = msg
                .body()
                .deserialize::<(OwnedObjectPath, InterfaceProps)>()
            else {
                continue;
            };
            let Some(csr) = ifaces
                .get(CSR_IFACE)
                .and_then(|p| p.get("CSR"))
                .and_then(value_str)
            else {
                continue;
            };
            let id = entry_id(&path);
            let staged = staging.join("certs").join(format!("csr.{id}"));
            if let Some(dir) = staged.parent() {
                if let Err(e) = fs::create_dir_all(dir) {
                    warn!("cert staging dir failed: {e}");
                    continue;
                }
            }
            if let Err(e) = fs::write(&staged, csr.as_bytes()) {
                warn!("CSR file {} failed: {e}", staged.display());
                continue;
            }
            info!("CSR {id} staged for signing");
            notify(
                notifier
                    .new_file_available(
                        file_type::CERT_SIGNING_REQUEST,
                        id,
                        csr.len() as u64,
                    )
                    .await,
                "certificate signing request",
            );
        }
        Ok::<(), zbus::Error>(())
    };
    if let Err(e) = run.await {
        warn!("CSR watch ended: {e}");
    }
}

async fn watch_licenses(
    conn: Connection,
    notifier: Rc<HostNotifier>,
    staging: PathBuf,
) {
    let run = async {
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface("org.freedesktop.DBus.Properties")?
            .member("PropertiesChanged")?
            .path(LICENSE_PATH)?
            .build();
        let mut stream = MessageStream::for_match_rule(rule, &conn, None).await?;
        while let Some(msg) = stream.next().await {
            let Ok(msg) = msg else { continue };
            let Ok((iface, changed, _invalidated)) =
                msg.body().deserialize::<(
                    String,
                    HashMap<String, OwnedValue>,
                    Vec<String>,
                )>()
            else {
                continue;
            };
            if iface != LICENSE_IFACE {
                continue;
            }
            let Some(license) =
                changed.get("LicenseString").and_then(value_str)
            else {
                continue;
            };
            if license.is_empty() {
                continue;
            }
            let staged = staging.join("license/pending.bin");
            if let Some(dir) = staged.parent() {
                if let Err(e) = fs::create_dir_all(dir) {
                    warn!("license staging dir failed: {e}");
                    continue;
                }
            }
            if let Err(e) = fs::write(&staged, license.as_bytes()) {
                warn!("license file {} failed: {e}", staged.display());
                continue;
            }
            info!("license activation staged");
            notify(
                notifier
                    .new_file_available(
                        file_type::COD_LICENSE,
                        0,
                        license.len() as u64,
                    )
                    .await,
                "license activation",
            );
        }
        Ok::<(), zbus::Error>(())
    };
    if let Err(e) = run.await {
        warn!("license watch ended: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_ids_parse_from_paths() {
        let p = ObjectPath::try_from(
            "/xyz/openbmc_project/dump/resource/entry/7",
        )
        .unwrap();
        assert_eq!(entry_id(&p), 7);
        let p = ObjectPath::try_from("/com/ibm/license").unwrap();
        assert_eq!(entry_id(&p), 0);
    }
}

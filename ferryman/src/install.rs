//! `ferryman install`: put the binary in place and register the systemd
//! unit.

use std::path::Path;
use std::process::Command;

use anyhow::Context as _;

const BIN_PATH: &str = "/usr/local/bin/ferryman";
const UNIT_PATH: &str = "/etc/systemd/system/ferryman.service";
const CONFIG_DIR: &str = "/etc/ferryman";

const CONFIG_TEMPLATE: &str = r#"{
  "lisa": {
    "host": ""
  },
  "john": {
    "listen": "0.0.0.0:8880",
    "protocol": "shadowsocks",
    "name": "",
    "hostname": "",
    "ticket": ""
  }
}
"#;

fn unit_file(user: Option<&str>, group: Option<&str>) -> String {
    let mut unit = String::from(
        "[Unit]\n\
         Description=Ferryman relay node\n\
         After=network-online.target\n\
         \n\
         [Service]\n",
    );
    if let Some(user) = user {
        unit.push_str(&format!("User={user}\n"));
    }
    if let Some(group) = group {
        unit.push_str(&format!("Group={group}\n"));
    }
    unit.push_str(
        "ExecStart=/usr/local/bin/ferryman run -c /etc/ferryman/ferryman.json\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
    );
    unit
}

pub fn install(user: Option<&str>, group: Option<&str>) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions.
        anyhow::ensure!(unsafe { libc::geteuid() } == 0, "install requires root");
    }

    let current = std::env::current_exe().context("locate current binary")?;
    if current != Path::new(BIN_PATH) {
        std::fs::copy(&current, BIN_PATH).with_context(|| format!("copy binary to {BIN_PATH}"))?;
        info!(path = BIN_PATH, "binary installed");
    }

    std::fs::create_dir_all(CONFIG_DIR).context("create config directory")?;
    let config_path = Path::new(CONFIG_DIR).join(crate::config::CONFIG_FILE);
    if !config_path.exists() {
        std::fs::write(&config_path, CONFIG_TEMPLATE).context("write config template")?;
        info!(path = %config_path.display(), "config template written, fill it in before starting");
    }

    std::fs::write(UNIT_PATH, unit_file(user, group)).with_context(|| format!("write {UNIT_PATH}"))?;
    info!(path = UNIT_PATH, "systemd unit written");

    let reload = Command::new("systemctl").arg("daemon-reload").status();
    let enable = Command::new("systemctl").args(["enable", "ferryman.service"]).status();
    match (reload, enable) {
        (Ok(reload), Ok(enable)) if reload.success() && enable.success() => {
            info!("service enabled; start it with: systemctl start ferryman.service");
        }
        _ => warn!("systemctl invocation failed; enable the service manually"),
    }
    Ok(())
}

use std::fs;

use which::which;

const UNIT_NAME: &str = concat!(env!("CARGO_PKG_NAME"), ".service");

fn unit_contents(exec: &str) -> String {
    format!(
        "[Unit]\n\
         Description={desc}\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exec}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        desc = env!("CARGO_PKG_DESCRIPTION"),
        exec = exec,
    )
}

/// Write a systemd user unit for this binary. Prefers the copy on PATH so
/// the unit survives a rebuild in a different target directory, falling
/// back to the running executable.
pub fn create_systemd_unit(server: &Option<String>) -> anyhow::Result<()> {
    let binary = match which(env!("CARGO_PKG_NAME")) {
        Ok(path) => path,
        Err(_) => std::env::current_exe()?,
    };

    let mut exec = binary.to_string_lossy().into_owned();
    if let Some(server) = server {
        exec.push_str(" -s ");
        exec.push_str(server);
    }

    let unit_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("No user config directory"))?
        .join("systemd")
        .join("user");
    fs::create_dir_all(&unit_dir)?;

    let unit_file = unit_dir.join(UNIT_NAME);
    fs::write(&unit_file, unit_contents(&exec))?;

    println!("Installed {}", unit_file.display());
    println!("Enable it with: systemctl --user enable --now {}", UNIT_NAME);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_carries_exec_line_and_package_description() {
        let unit = unit_contents("/usr/bin/slimwire -s 192.168.1.10");
        assert!(unit.contains("ExecStart=/usr/bin/slimwire -s 192.168.1.10\n"));
        assert!(unit.contains(concat!("Description=", env!("CARGO_PKG_DESCRIPTION"))));
        assert!(unit.contains("WantedBy=default.target"));
    }

    #[test]
    fn unit_name_follows_the_package() {
        assert_eq!(UNIT_NAME, concat!(env!("CARGO_PKG_NAME"), ".service"));
    }
}

use std::io;
use std::process::Command;
use std::process::Stdio;

/// Opens `url` in the user's default browser without waiting for it.
pub fn open_in_browser(url: &str) -> io::Result<()> {
    browser_command(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}

#[cfg(target_os = "windows")]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("cmd");
    // The empty argument is the window title `start` expects first.
    cmd.args(["/C", "start", "", url]);
    cmd
}

#[cfg(target_os = "macos")]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("open");
    cmd.arg(url);
    cmd
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("xdg-open");
    cmd.arg(url);
    cmd
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn passes_url_as_last_argument() {
        let cmd = browser_command("https://microsoft.com/devicelogin");
        assert_eq!(
            cmd.get_args().last().and_then(|arg| arg.to_str()),
            Some("https://microsoft.com/devicelogin")
        );
    }
}

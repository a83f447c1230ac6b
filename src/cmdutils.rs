use std::process::Command;

use anyhow::{Result, bail};

pub(crate) trait CommandRunExt {
    fn run(&mut self) -> Result<()>;
    fn run_get_output(&mut self) -> Result<String>;
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        let r = self.status()?;
        if !r.success() {
            bail!("Child [{:?}] exited: {}", self, r);
        }
        Ok(())
    }

    fn run_get_output(&mut self) -> Result<String> {
        let r = self.output()?;
        if !r.status.success() {
            bail!(
                "Child [{:?}] exited: {}: {}",
                self,
                r.status,
                String::from_utf8_lossy(&r.stderr)
            );
        }
        Ok(String::from_utf8(r.stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run() {
        assert!(Command::new("true").run().is_ok());
        assert!(Command::new("false").run().is_err());
    }

    #[test]
    fn test_run_get_output() {
        let out = Command::new("echo").arg("hi").run_get_output().unwrap();
        assert_eq!(out, "hi\n");
    }
}

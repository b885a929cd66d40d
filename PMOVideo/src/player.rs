//! Playback through an external command (`mpv`, `vlc`, ...).

use std::process::{Child, Command, ExitStatus};

use pmoremote::{CollaboratorError, PlaybackSurface};
use tracing::{debug, info};
use url::Url;

pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
    loaded: Option<Url>,
    child: Option<Child>,
}

impl CommandPlayer {
    /// `command` is split on whitespace: `"mpv --fs"` gives program `mpv`
    /// with argument `--fs`. The stream URL is appended last.
    pub fn new(command: &str) -> Result<Self, CollaboratorError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| CollaboratorError::Player("empty player command".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            loaded: None,
            child: None,
        })
    }

    /// Waits for the player process to exit.
    pub fn wait(&mut self) -> Result<Option<ExitStatus>, CollaboratorError> {
        match self.child.as_mut() {
            Some(child) => Ok(Some(child.wait()?)),
            None => Ok(None),
        }
    }

    fn command_line(&self, url: &Url) -> Vec<String> {
        let mut line = vec![self.program.clone()];
        line.extend(self.args.iter().cloned());
        line.push(url.to_string());
        line
    }
}

impl PlaybackSurface for CommandPlayer {
    fn load(&mut self, url: &Url) -> Result<(), CollaboratorError> {
        debug!(%url, "Loading stream");
        self.loaded = Some(url.clone());
        Ok(())
    }

    fn play(&mut self) -> Result<(), CollaboratorError> {
        let url = self
            .loaded
            .clone()
            .ok_or_else(|| CollaboratorError::Player("no stream loaded".into()))?;
        if self.child.is_some() {
            return Ok(());
        }
        let line = self.command_line(&url);
        info!(command = %line.join(" "), "Launching player");
        let child = Command::new(&line[0])
            .args(&line[1..])
            .spawn()
            .map_err(|e| CollaboratorError::Player(format!("{}: {e}", self.program)))?;
        self.child = Some(child);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::unsupported("pause"))
    }

    fn is_ready(&self) -> bool {
        self.loaded.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let player = CommandPlayer::new("mpv --fs  --really-quiet").unwrap();
        let url = Url::parse("http://192.168.1.5:8080/video/x1").unwrap();
        assert_eq!(
            player.command_line(&url),
            vec![
                "mpv",
                "--fs",
                "--really-quiet",
                "http://192.168.1.5:8080/video/x1"
            ]
        );
    }

    #[test]
    fn test_lifecycle() {
        assert!(CommandPlayer::new("   ").is_err());

        let mut player = CommandPlayer::new("true").unwrap();
        assert!(!player.is_ready());
        assert!(player.play().is_err());

        player
            .load(&Url::parse("http://host:1/video/x").unwrap())
            .unwrap();
        assert!(player.is_ready());
        assert!(matches!(
            player.pause(),
            Err(CollaboratorError::Unsupported(_))
        ));
    }
}

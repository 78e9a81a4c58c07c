//! Passphrase prompts and content reading for record commands.

use std::{
    fs,
    io::{self, IsTerminal, Read},
    path::Path,
};

use color_eyre::{eyre::eyre, Result};
use dialoguer::{Confirm, Password};
use phivault_storage::passphrase_backend::validate_passphrase;
use zeroize::Zeroizing;

pub const PASSPHRASE_ENV: &str = "PHIVAULT_PASSPHRASE";

/// Passphrase from `PHIVAULT_PASSPHRASE`, or an interactive prompt.
pub fn prompt_passphrase() -> Result<Zeroizing<String>> {
    if let Some(value) = passphrase_from_env() {
        return Ok(value);
    }
    if !io::stdin().is_terminal() {
        return Err(eyre!(
            "no passphrase provided and no TTY available; set {PASSPHRASE_ENV}"
        ));
    }
    Password::new()
        .with_prompt("Passphrase")
        .interact()
        .map(Zeroizing::new)
        .map_err(|e| eyre!("failed to read passphrase: {e}"))
}

/// New passphrase with confirmation, checked against the passphrase policy.
pub fn prompt_new_passphrase() -> Result<Zeroizing<String>> {
    if let Some(value) = passphrase_from_env() {
        validate_passphrase(&value)?;
        return Ok(value);
    }
    loop {
        let passphrase = Zeroizing::new(
            Password::new()
                .with_prompt("New passphrase")
                .with_confirmation("Confirm passphrase", "Passphrases do not match")
                .interact()
                .map_err(|e| eyre!("failed to read passphrase: {e}"))?,
        );
        if let Err(err) = validate_passphrase(&passphrase) {
            eprintln!("{err}");
            continue;
        }
        return Ok(passphrase);
    }
}

fn passphrase_from_env() -> Option<Zeroizing<String>> {
    std::env::var(PASSPHRASE_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(Zeroizing::new)
}

/// Yes/no question; `assume_yes` skips the prompt.
pub fn confirm(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    if !io::stdin().is_terminal() {
        return Err(eyre!("refusing to continue without a TTY; pass --yes"));
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| eyre!("failed to read confirmation: {e}"))
}

/// Record content from `--body`, or piped stdin.
pub fn read_body(body: Option<String>) -> Result<String> {
    let text = match body {
        Some(value) => value,
        None => {
            if io::stdin().is_terminal() {
                return Err(eyre!("pass --body or pipe the content on stdin"));
            }
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return Err(eyre!("record content cannot be empty"));
    }
    Ok(trimmed.to_string())
}

/// Raw capture bytes from a file, or piped stdin.
pub fn read_capture(file: Option<&Path>) -> Result<Vec<u8>> {
    let bytes = match file {
        Some(path) => fs::read(path)?,
        None => {
            if io::stdin().is_terminal() {
                return Err(eyre!("pass --file or pipe the capture on stdin"));
            }
            let mut buffer = Vec::new();
            io::stdin().read_to_end(&mut buffer)?;
            buffer
        }
    };
    if bytes.is_empty() {
        return Err(eyre!("capture is empty"));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_flag_is_trimmed() {
        assert_eq!(read_body(Some("note\n\n".into())).expect("body"), "note");
    }

    #[test]
    fn blank_body_is_rejected() {
        assert!(read_body(Some("  \n".into())).is_err());
    }

    #[test]
    fn capture_is_read_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("capture.raw");
        fs::write(&path, b"pcm bytes").expect("write");
        assert_eq!(read_capture(Some(&path)).expect("read"), b"pcm bytes");

        fs::write(&path, b"").expect("truncate");
        assert!(read_capture(Some(&path)).is_err());
    }

    #[test]
    fn assume_yes_skips_prompt() {
        assert!(confirm("Delete?", true).expect("confirm"));
    }
}

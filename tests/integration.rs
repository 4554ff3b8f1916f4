use anyhow::Result;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use xcrypt::algorithms::{CipherAlgorithm, CipherMode, HashAlgorithm, MacAlgorithm};
use xcrypt::engine::Progress;
use xcrypt::header::{self, HEADER_0, HEADER_1};
use xcrypt::key_manager::KeyMaterial;
use xcrypt::{CryptError, CryptoSession, FormatVersion, Output, SessionOptions, Source, Status};

/// Cheap key derivation so the suite stays fast
fn fast_options() -> SessionOptions {
    SessionOptions {
        kdf_iterations: 1000,
        ..SessionOptions::default()
    }
}

fn password(pw: &str) -> KeyMaterial {
    KeyMaterial::from_password(pw).expect("non-empty password")
}

async fn run(mut session: CryptoSession) -> Result<Status> {
    session.execute()?;
    Ok(session.join().await)
}

async fn encrypt(source: &Path, output: &Path, pw: &str, options: SessionOptions) -> Result<Status> {
    let session = CryptoSession::encrypt(
        Source::Path(source.to_path_buf()),
        Output::Path(output.to_path_buf()),
        password(pw),
        options,
    )?;
    run(session).await
}

async fn decrypt(source: &Path, output: &Path, pw: &str, options: SessionOptions) -> Result<Status> {
    let session = CryptoSession::decrypt(
        Source::Path(source.to_path_buf()),
        Output::Path(output.to_path_buf()),
        password(pw),
        options,
    )?;
    run(session).await
}

/// Encrypts `data` and decrypts it again, returning the restored bytes.
async fn round_trip(data: &[u8], options: SessionOptions) -> Result<Vec<u8>> {
    let tmp = TempDir::new()?;
    let input = tmp.path().join("plain.bin");
    let container = tmp.path().join("plain.bin.x");
    let restored = tmp.path().join("restored.bin");
    fs::write(&input, data)?;

    let label = format!("{:?}", options);
    assert_eq!(
        encrypt(&input, &container, "round trip", options.clone()).await?,
        Status::Success,
        "encrypt with {label}"
    );
    assert_eq!(
        decrypt(&container, &restored, "round trip", options).await?,
        Status::Success,
        "decrypt with {label}"
    );
    Ok(fs::read(&restored)?)
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Runs a session to the end, checking the total counter only moves forward.
async fn run_watching_progress(mut session: CryptoSession) -> Result<(Status, Progress)> {
    session.execute()?;
    let mut last = 0;
    while !session.worker_finished() {
        let total = session.total();
        assert!(total.offset >= last, "progress went backwards");
        assert!(total.offset <= total.size);
        last = total.offset;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let status = session.join().await;
    Ok((status, session.total()))
}

/// Starts a session and cancels it once the first bytes went through.
async fn cancel_midway(mut session: CryptoSession) -> Result<Status> {
    session.execute()?;
    while session.current().offset == 0 && !session.worker_finished() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    session.cancel();
    Ok(tokio::time::timeout(Duration::from_secs(60), session.join()).await?)
}

#[tokio::test]
async fn test_round_trip_every_cipher_and_mode() -> Result<()> {
    let data = sample(5000);
    for cipher in CipherAlgorithm::ALL {
        for mode in CipherMode::ALL {
            let options = SessionOptions {
                cipher,
                mode,
                ..fast_options()
            };
            assert_eq!(round_trip(&data, options).await?, data, "{cipher} {mode}");
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_round_trip_every_hash_and_mac() -> Result<()> {
    let data = sample(3000);
    for hash in HashAlgorithm::ALL {
        let options = SessionOptions {
            hash,
            mac: MacAlgorithm(hash),
            compress: false,
            ..fast_options()
        };
        assert_eq!(round_trip(&data, options).await?, data, "{hash}");
    }
    Ok(())
}

#[tokio::test]
async fn test_round_trip_every_version() -> Result<()> {
    let data = sample(10_000);
    for version in FormatVersion::ALL {
        let options = SessionOptions {
            version,
            ..fast_options()
        };
        assert_eq!(round_trip(&data, options).await?, data, "version {version}");
    }
    Ok(())
}

#[tokio::test]
async fn test_empty_file_round_trip() -> Result<()> {
    for compress in [true, false] {
        let options = SessionOptions {
            compress,
            ..fast_options()
        };
        assert!(round_trip(b"", options).await?.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_wrong_password_creates_no_output() -> Result<()> {
    let tmp = TempDir::new()?;
    let input = tmp.path().join("secret.txt");
    let container = tmp.path().join("secret.x");
    let restored = tmp.path().join("restored.txt");
    fs::write(&input, b"the eagle lands at midnight")?;

    assert_eq!(encrypt(&input, &container, "right", fast_options()).await?, Status::Success);
    assert_eq!(
        decrypt(&container, &restored, "wrong", fast_options()).await?,
        Status::FailedDecryption
    );
    assert!(!restored.exists());
    Ok(())
}

#[tokio::test]
async fn test_unknown_version_magic() -> Result<()> {
    let tmp = TempDir::new()?;
    let container = tmp.path().join("future.x");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&HEADER_0.to_be_bytes());
    bytes.extend_from_slice(&HEADER_1.to_be_bytes());
    bytes.extend_from_slice(&0x0123_4567_89ab_cdefu64.to_be_bytes());
    bytes.extend_from_slice(&[0u8; 64]);
    fs::write(&container, &bytes)?;

    assert!(!header::is_encrypted(&container));
    assert_eq!(
        decrypt(&container, &tmp.path().join("out"), "pw", fast_options()).await?,
        Status::FailedUnknownVersion
    );
    Ok(())
}

#[tokio::test]
async fn test_probe_reports_header() -> Result<()> {
    let tmp = TempDir::new()?;
    let input = tmp.path().join("a.txt");
    let container = tmp.path().join("a.x");
    fs::write(&input, b"probe me")?;

    let options = SessionOptions {
        cipher: CipherAlgorithm::Serpent256,
        mode: CipherMode::Cbc,
        ..fast_options()
    };
    assert_eq!(encrypt(&input, &container, "pw", options).await?, Status::Success);

    assert!(header::is_encrypted(&container));
    assert!(!header::is_encrypted(&input));
    let info = header::probe(&mut fs::File::open(&container)?)?.expect("container header");
    assert_eq!(info.version, FormatVersion::CURRENT);
    assert_eq!(info.algorithms.cipher, CipherAlgorithm::Serpent256);
    assert_eq!(info.algorithms.mode, CipherMode::Cbc);
    assert_eq!(info.algorithms.kdf_iterations, 1000);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_directory_tree_round_trip() -> Result<()> {
    use std::os::unix::fs::{symlink, MetadataExt};

    const N: usize = 3 * 1024 + 5;
    let tmp = TempDir::new()?;
    let root = tmp.path().join("tree");
    fs::create_dir_all(root.join("empty"))?;
    fs::write(root.join("data.bin"), sample(N))?;
    symlink("data.bin", root.join("link"))?;
    fs::hard_link(root.join("data.bin"), root.join("hard1"))?;
    fs::hard_link(root.join("data.bin"), root.join("hard2"))?;

    let container = tmp.path().join("tree.x");
    let restored = tmp.path().join("restored");
    assert_eq!(encrypt(&root, &container, "tree", fast_options()).await?, Status::Success);
    assert_eq!(decrypt(&container, &restored, "tree", fast_options()).await?, Status::Success);

    let out = restored.join("tree");
    assert!(out.join("empty").is_dir());
    assert_eq!(fs::read(out.join("data.bin"))?, sample(N));
    assert!(fs::symlink_metadata(out.join("link"))?.file_type().is_symlink());
    assert_eq!(fs::read_link(out.join("link"))?, Path::new("data.bin"));
    assert_eq!(fs::read(out.join("link"))?, sample(N));

    let inode = fs::metadata(out.join("data.bin"))?.ino();
    assert_eq!(fs::metadata(out.join("hard1"))?.ino(), inode);
    assert_eq!(fs::metadata(out.join("hard2"))?.ino(), inode);
    assert_eq!(fs::metadata(out.join("data.bin"))?.nlink(), 3);
    Ok(())
}

#[tokio::test]
async fn test_directory_into_file_is_output_mismatch() -> Result<()> {
    let tmp = TempDir::new()?;
    let root = tmp.path().join("tree");
    fs::create_dir_all(&root)?;
    fs::write(root.join("x.txt"), b"x")?;
    let container = tmp.path().join("tree.x");
    let occupied = tmp.path().join("occupied.txt");
    fs::write(&occupied, b"keep me")?;

    assert_eq!(encrypt(&root, &container, "pw", fast_options()).await?, Status::Success);
    assert_eq!(
        decrypt(&container, &occupied, "pw", fast_options()).await?,
        Status::FailedOutputMismatch
    );
    assert_eq!(fs::read(&occupied)?, b"keep me");
    Ok(())
}

#[tokio::test]
async fn test_old_version_refuses_directory() -> Result<()> {
    let tmp = TempDir::new()?;
    let root = tmp.path().join("tree");
    fs::create_dir_all(&root)?;

    let options = SessionOptions {
        version: FormatVersion::V2011_08,
        ..fast_options()
    };
    let result = CryptoSession::encrypt(
        Source::Path(root),
        Output::Path(tmp.path().join("tree.x")),
        password("pw"),
        options,
    );
    assert!(matches!(result, Err(CryptError::Compatibility(_))));
    Ok(())
}

#[tokio::test]
async fn test_raw_mode_round_trip() -> Result<()> {
    let data = sample(2 * 1024 + 17);
    for compress in [true, false] {
        let options = SessionOptions {
            raw: true,
            compress,
            cipher: CipherAlgorithm::Twofish256,
            mode: CipherMode::Ofb,
            ..fast_options()
        };
        assert_eq!(round_trip(&data, options).await?, data);
    }
    Ok(())
}

#[tokio::test]
async fn test_directory_outputs_use_stored_names() -> Result<()> {
    let tmp = TempDir::new()?;
    let input = tmp.path().join("notes.txt");
    fs::write(&input, b"remember the milk")?;
    let vault = tmp.path().join("vault");
    let restore = tmp.path().join("restore");
    fs::create_dir_all(&vault)?;
    fs::create_dir_all(&restore)?;

    assert_eq!(encrypt(&input, &vault, "pw", fast_options()).await?, Status::Success);
    let container = vault.join("notes.txt.x");
    assert!(container.is_file());

    assert_eq!(decrypt(&container, &restore, "pw", fast_options()).await?, Status::Success);
    assert_eq!(fs::read(restore.join("notes.txt"))?, b"remember the milk");
    Ok(())
}

#[tokio::test]
async fn test_progress_is_monotonic() -> Result<()> {
    let tmp = TempDir::new()?;
    let input = tmp.path().join("big.bin");
    let data = sample(4 * 1024 * 1024);
    fs::write(&input, &data)?;

    let container = tmp.path().join("big.x");
    let session = CryptoSession::encrypt(
        Source::Path(input),
        Output::Path(container.clone()),
        password("progress"),
        fast_options(),
    )?;
    let (status, total) = run_watching_progress(session).await?;
    assert_eq!(status, Status::Success);
    assert_eq!(total, Progress { offset: data.len() as u64, size: data.len() as u64 });

    let session = CryptoSession::decrypt(
        Source::Path(container),
        Output::Path(tmp.path().join("big.out")),
        password("progress"),
        fast_options(),
    )?;
    let (status, total) = run_watching_progress(session).await?;
    assert_eq!(status, Status::Success);
    assert_eq!(total, Progress { offset: data.len() as u64, size: data.len() as u64 });
    Ok(())
}

#[tokio::test]
async fn test_directory_decode_counts_entries() -> Result<()> {
    let tmp = TempDir::new()?;
    let root = tmp.path().join("tree");
    fs::create_dir_all(root.join("sub"))?;
    fs::write(root.join("a.bin"), sample(256 * 1024))?;
    fs::write(root.join("sub/b.bin"), sample(1024 * 1024))?;
    let container = tmp.path().join("tree.x");
    assert_eq!(encrypt(&root, &container, "entries", fast_options()).await?, Status::Success);

    let session = CryptoSession::decrypt(
        Source::Path(container),
        Output::Path(tmp.path().join("restored")),
        password("entries"),
        fast_options(),
    )?;
    let (status, total) = run_watching_progress(session).await?;
    assert_eq!(status, Status::Success);
    // tree, tree/a.bin, tree/sub, tree/sub/b.bin
    assert_eq!(total, Progress { offset: 4, size: 4 });
    Ok(())
}

#[tokio::test]
async fn test_cancel_removes_partial_container() -> Result<()> {
    let tmp = TempDir::new()?;
    let input = tmp.path().join("huge.bin");
    fs::write(&input, sample(16 * 1024 * 1024))?;
    let container = tmp.path().join("huge.x");

    // Default key derivation keeps the worker busy long enough to cancel
    let mut session = CryptoSession::encrypt(
        Source::Path(input),
        Output::Path(container.clone()),
        password("cancel"),
        SessionOptions::default(),
    )?;
    session.execute()?;
    session.cancel();

    let status = tokio::time::timeout(Duration::from_secs(30), session.join()).await?;
    assert_eq!(status, Status::Cancelled);
    assert!(status.is_failure());
    assert!(!container.exists());
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_encode_removes_container() -> Result<()> {
    let tmp = TempDir::new()?;
    let input = tmp.path().join("huge.bin");
    fs::write(&input, sample(64 * 1024 * 1024))?;
    let container = tmp.path().join("huge.x");

    let options = SessionOptions {
        cipher: CipherAlgorithm::Serpent256,
        compress: false,
        ..fast_options()
    };
    let session = CryptoSession::encrypt(
        Source::Path(input),
        Output::Path(container.clone()),
        password("cancel"),
        options,
    )?;
    assert_eq!(cancel_midway(session).await?, Status::Cancelled);
    assert!(!container.exists());
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_decode_removes_output() -> Result<()> {
    let tmp = TempDir::new()?;
    let input = tmp.path().join("huge.bin");
    fs::write(&input, sample(64 * 1024 * 1024))?;
    let container = tmp.path().join("huge.x");
    let restored = tmp.path().join("huge.out");

    let options = SessionOptions {
        cipher: CipherAlgorithm::Serpent256,
        compress: false,
        ..fast_options()
    };
    assert_eq!(encrypt(&input, &container, "cancel", options.clone()).await?, Status::Success);

    let session = CryptoSession::decrypt(
        Source::Path(container.clone()),
        Output::Path(restored.clone()),
        password("cancel"),
        options,
    )?;
    assert_eq!(cancel_midway(session).await?, Status::Cancelled);
    assert!(!restored.exists());
    assert!(container.exists());
    Ok(())
}

#[tokio::test]
async fn test_output_onto_input_is_refused() -> Result<()> {
    let tmp = TempDir::new()?;
    let input = tmp.path().join("same.txt");
    fs::write(&input, b"do not truncate me")?;

    let result = CryptoSession::encrypt(
        Source::Path(input.clone()),
        Output::Path(input.clone()),
        password("pw"),
        fast_options(),
    );
    assert!(matches!(result, Err(CryptError::OutputMismatch(_))));
    assert_eq!(fs::read(&input)?, b"do not truncate me");

    #[cfg(unix)]
    {
        let alias = tmp.path().join("alias.txt");
        std::os::unix::fs::symlink(&input, &alias)?;
        let result = CryptoSession::encrypt(
            Source::Path(input.clone()),
            Output::Path(alias),
            password("pw"),
            fast_options(),
        );
        assert!(matches!(result, Err(CryptError::OutputMismatch(_))));
        assert_eq!(fs::read(&input)?, b"do not truncate me");
    }
    Ok(())
}

#[tokio::test]
async fn test_key_file_round_trip() -> Result<()> {
    let tmp = TempDir::new()?;
    let key_path = tmp.path().join("key.bin");
    fs::write(&key_path, [0x42u8; 64])?;
    let input = tmp.path().join("in.txt");
    let container = tmp.path().join("in.x");
    let restored = tmp.path().join("out.txt");
    fs::write(&input, b"keyed by file")?;

    let session = CryptoSession::encrypt(
        Source::Path(input),
        Output::Path(container.clone()),
        KeyMaterial::from_file(&key_path).await?,
        fast_options(),
    )?;
    assert_eq!(run(session).await?, Status::Success);

    let session = CryptoSession::decrypt(
        Source::Path(container),
        Output::Path(restored.clone()),
        KeyMaterial::from_bytes(vec![0x42u8; 64])?,
        fast_options(),
    )?;
    assert_eq!(run(session).await?, Status::Success);
    assert_eq!(fs::read(&restored)?, b"keyed by file");
    Ok(())
}

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use assert_cmd::prelude::*;
use image::{Rgb, RgbImage};
use predicates::prelude::*;
use rstest::*;
use tempfile::TempDir;

macro_rules! cargo_run {
    ($dir:expr, $($args:expr),*) => {
        {
            let mut cmd = Command::cargo_bin("foodvision")?;
            cmd.arg("-s").arg($dir.path().join("storage"));
            cmd.arg("-M").arg($dir.path().join("models"));
            cmd.env_remove("ANTHROPIC_API_KEY");
            $(cmd.arg($args);)*
            cmd.assert()
        }
    };
}

fn write_dish(dir: &Path, label: &str, name: &str, color: [u8; 3]) -> Result<()> {
    let dir = dir.join(label);
    fs::create_dir_all(&dir)?;
    RgbImage::from_pixel(32, 32, Rgb(color)).save(dir.join(name))?;
    Ok(())
}

/// 初始化模型并添加两类参考图
#[fixture]
fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    let dataset = dir.path().join("dataset");
    write_dish(&dataset, "番茄炒蛋", "1.png", [220, 40, 30]).unwrap();
    write_dish(&dataset, "番茄炒蛋", "2.png", [230, 50, 20]).unwrap();
    write_dish(&dataset, "salad", "1.png", [30, 200, 40]).unwrap();
    fs::write(dataset.join("salad/notes.txt"), "not an image").unwrap();
    dir
}

#[rstest]
fn init_twice_requires_force(workspace: TempDir) -> Result<()> {
    cargo_run!(workspace, "train", "--init").success();
    cargo_run!(workspace, "train", "--init").failure().stderr(predicate::str::contains("--force"));
    cargo_run!(workspace, "train", "--init", "--force").success();
    Ok(())
}

#[rstest]
fn add_without_model_fails(workspace: TempDir) -> Result<()> {
    cargo_run!(workspace, "add", workspace.path().join("dataset"))
        .failure()
        .stderr(predicate::str::contains("train --init"));
    Ok(())
}

#[rstest]
fn add_train_search(workspace: TempDir) -> Result<()> {
    cargo_run!(workspace, "train", "--init").success();
    cargo_run!(workspace, "add", workspace.path().join("dataset"))
        .success()
        .stdout(predicate::str::contains("added: 3"));

    // 第二次添加全部重复
    cargo_run!(workspace, "add", workspace.path().join("dataset"))
        .success()
        .stdout(predicate::str::contains("duplicate: 3"));

    cargo_run!(workspace, "train")
        .success()
        .stdout(predicate::str::contains("2\t番茄炒蛋").and(predicate::str::contains("1\tsalad")));

    let query = workspace.path().join("dataset/番茄炒蛋/1.png");
    cargo_run!(workspace, "search", &query)
        .success()
        .stdout(predicate::str::contains("decision\tmatched").and(predicate::str::contains("番茄炒蛋")));

    cargo_run!(workspace, "search", &query, "--output-format", "json")
        .success()
        .stdout(predicate::str::contains("\"decision\": \"matched\""));

    cargo_run!(workspace, "show", "--label", "salad")
        .success()
        .stdout(predicate::str::contains("salad").and(predicate::str::contains("番茄炒蛋").not()));
    Ok(())
}

#[rstest]
fn add_with_explicit_label(workspace: TempDir) -> Result<()> {
    cargo_run!(workspace, "train", "--init").success();
    let image = workspace.path().join("dataset/salad/1.png");
    cargo_run!(workspace, "add", &image, "--label", "caesar", "--ingredients", "lettuce,croutons")
        .success()
        .stdout(predicate::str::contains("added: 1"));
    cargo_run!(workspace, "show", "--output-format", "json")
        .success()
        .stdout(predicate::str::contains("caesar").and(predicate::str::contains("croutons")));
    Ok(())
}

#[rstest]
fn purge_removes_expired_uploads(workspace: TempDir) -> Result<()> {
    let temp = workspace.path().join("storage/temp");
    fs::create_dir_all(&temp)?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
    fs::write(temp.join("1700000000000-abcdef.png"), b"stale")?;
    fs::write(temp.join(format!("{now:013}-ghijkl.png")), b"fresh")?;

    cargo_run!(workspace, "purge", "--temp-retention", "3600").success().stdout("1\n");
    assert_eq!(fs::read_dir(&temp)?.count(), 1);
    cargo_run!(workspace, "purge", "--temp-retention", "0").success().stdout("1\n");
    assert_eq!(fs::read_dir(&temp)?.count(), 0);
    Ok(())
}

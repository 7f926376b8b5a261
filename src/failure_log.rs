use super::errors::FailureLogError;
use parking_lot::Mutex;
use std::{
    fs::{File, OpenOptions},
    io::{LineWriter, Write},
    path::{Path, PathBuf},
};


/// Журнал неудавшейся работы: только дописывание, одна строка на единицу
pub trait FailureLog: Send + Sync {
    fn record(&self, line: &str) -> Result<(), FailureLogError>;

    fn flush(&self) -> Result<(), FailureLogError> {
        Ok(())
    }
}

pub struct FileFailureLog {
    path: PathBuf,
    writer: Mutex<LineWriter<File>>,
}

impl FileFailureLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FailureLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(LineWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FailureLog for FileFailureLog {
    fn record(&self, line: &str) -> Result<(), FailureLogError> {
        let mut writer = self.writer.lock();
        // переводы строк внутри описания сломали бы формат «одна строка — одна единица»
        writeln!(writer, "{}", line.replace('\n', " "))?;
        Ok(())
    }

    fn flush(&self) -> Result<(), FailureLogError> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryFailureLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryFailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl FailureLog for MemoryFailureLog {
    fn record(&self, line: &str) -> Result<(), FailureLogError> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}

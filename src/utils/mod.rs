pub mod external_prog;
pub mod report;
pub mod results_uploader;

pub fn dump_file(name: &str, ext: &str) -> String {
    format!("{}_{}.{}", name, chrono::Local::now().format("%Y-%m-%dT%H-%M-%S"), ext)
}

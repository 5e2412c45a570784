//! Built-in LXC setup scripts.
//!
//! Each body runs under `sh -c` inside a freshly started container: install
//! the toolchain, clone into the workdir, then launch the app detached with
//! output in `/var/log/{{APP_ID}}.log`.

use std::collections::HashMap;

use super::{GENERIC, Template, env, strings};

const PRELUDE: &str = r#"set -e
export DEBIAN_FRONTEND=noninteractive
{{ENV}}
export PORT={{PORT}}
apt-get update -y
"#;

const CLONE: &str = r#"rm -rf {{WORKDIR}}
{{FETCH_SOURCE}}
cd {{WORKDIR}}
"#;

fn script(packages: &str, build: &str, run: &str) -> String {
    format!(
        "{PRELUDE}apt-get install -y --no-install-recommends git ca-certificates {packages}\n{CLONE}{build}\nnohup sh -c '{run}' > /var/log/{{{{APP_ID}}}}.log 2>&1 &\necho {{{{APP_NAME}}}} started on port {{{{PORT}}}}\n"
    )
}

fn template(
    language: &str,
    base_image: &str,
    port: u16,
    command: &[&str],
    environment: HashMap<String, String>,
    body: String,
) -> Template {
    Template {
        language: language.to_string(),
        base_image: base_image.to_string(),
        build_steps: Vec::new(),
        port,
        workdir: "/app".to_string(),
        command: strings(command),
        environment,
        labels: HashMap::new(),
        body,
    }
}

pub(super) fn builtin() -> Vec<Template> {
    vec![
        template(
            "go",
            "ubuntu:22.04",
            8080,
            &["./app"],
            env(&[("GOPATH", "/go")]),
            script("golang-go build-essential", "go build -o app .", "./app"),
        ),
        template(
            "javascript",
            "ubuntu:22.04",
            3000,
            &["npm", "start"],
            env(&[("NODE_ENV", "production")]),
            script(
                "nodejs npm",
                "if [ -f package.json ]; then npm install && npm run build --if-present; fi",
                "if [ -f package.json ]; then npm start; else node app.js; fi",
            ),
        ),
        template(
            "python",
            "ubuntu:22.04",
            8000,
            &["python3", "app.py"],
            env(&[("PYTHONUNBUFFERED", "1")]),
            script(
                "python3 python3-pip python3-venv",
                "python3 -m venv .venv && if [ -f requirements.txt ]; then .venv/bin/pip install -r requirements.txt; fi",
                "if [ -f main.py ]; then .venv/bin/python main.py; else .venv/bin/python app.py; fi",
            ),
        ),
        template(
            "rust",
            "ubuntu:22.04",
            8080,
            &["./app"],
            HashMap::new(),
            script(
                "cargo build-essential",
                "cargo build --release && find target/release -maxdepth 1 -type f -perm -u+x -exec cp {} ./app \\;",
                "./app",
            ),
        ),
        template(
            "java",
            "ubuntu:22.04",
            8080,
            &["java", "-jar", "app.jar"],
            HashMap::new(),
            script(
                "openjdk-21-jdk maven",
                "if [ -f gradlew ]; then ./gradlew build -x test && cp build/libs/*.jar app.jar; else mvn -q -DskipTests package && cp target/*.jar app.jar; fi",
                "java -jar app.jar",
            ),
        ),
        template(
            "php",
            "ubuntu:22.04",
            8080,
            &["php", "-S", "0.0.0.0:8080"],
            HashMap::new(),
            script(
                "php-cli composer unzip",
                "if [ -f composer.json ]; then composer install --no-dev --no-interaction; fi",
                "php -S 0.0.0.0:$PORT",
            ),
        ),
        template(
            "ruby",
            "ubuntu:22.04",
            4567,
            &["bundle", "exec", "rackup"],
            env(&[("RACK_ENV", "production")]),
            script(
                "ruby-full build-essential",
                "gem install bundler && if [ -f Gemfile ]; then bundle install; fi",
                "bundle exec rackup --host 0.0.0.0 --port $PORT",
            ),
        ),
        template(
            GENERIC,
            "ubuntu:22.04",
            8080,
            &[],
            HashMap::new(),
            script(
                "curl",
                "true",
                "if [ -x ./start.sh ]; then ./start.sh; else sleep infinity; fi",
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_keeps_placeholders() {
        let body = script("golang-go", "go build", "./app");
        assert!(body.contains("/var/log/{{APP_ID}}.log"));
        assert!(body.contains("echo {{APP_NAME}} started on port {{PORT}}"));
        assert!(body.starts_with("set -e"));
        assert!(body.contains("rm -rf {{WORKDIR}}\n{{FETCH_SOURCE}}\ncd {{WORKDIR}}"));
    }
}

//! Built-in Dockerfile templates.
//!
//! Bodies get the source through `{{FETCH_SOURCE}}`: an anonymous clone at
//! build time, or a copy of the `source/` directory shipped in the build
//! context when the repository needs credentials.

use std::collections::HashMap;

use super::{GENERIC, Template, env, strings};

fn template(
    language: &str,
    base_image: &str,
    build_steps: &[&str],
    port: u16,
    command: &[&str],
    environment: HashMap<String, String>,
    body: &str,
) -> Template {
    Template {
        language: language.to_string(),
        base_image: base_image.to_string(),
        build_steps: strings(build_steps),
        port,
        workdir: "/app".to_string(),
        command: strings(command),
        environment,
        labels: HashMap::new(),
        body: body.to_string(),
    }
}

pub(super) fn builtin() -> Vec<Template> {
    vec![
        template(
            "go",
            "golang:1.24-alpine",
            &["go mod download", "go build -o app ."],
            8080,
            &["./app"],
            HashMap::new(),
            r#"FROM {{BASE_IMAGE}} AS builder
RUN apk add --no-cache git ca-certificates
WORKDIR {{WORKDIR}}
{{FETCH_SOURCE}}
RUN go mod download
RUN CGO_ENABLED=0 GOOS=linux go build -o app .

FROM alpine:3.20
RUN apk add --no-cache ca-certificates && adduser -D -s /bin/sh appuser
WORKDIR {{WORKDIR}}
COPY --from=builder {{WORKDIR}}/app .
RUN chown -R appuser:appuser {{WORKDIR}}
USER appuser
{{ENV}}
EXPOSE {{PORT}}
CMD ["./app"]
"#,
        ),
        template(
            "javascript",
            "node:22-alpine",
            &["npm ci", "npm run build --if-present"],
            3000,
            &["npm", "start"],
            env(&[("NODE_ENV", "production")]),
            r#"FROM {{BASE_IMAGE}} AS builder
RUN apk add --no-cache git
WORKDIR {{WORKDIR}}
{{FETCH_SOURCE}}
RUN if [ -f package-lock.json ]; then npm ci; else npm install; fi
RUN npm run build --if-present

FROM {{BASE_IMAGE}}
RUN apk add --no-cache dumb-init
WORKDIR {{WORKDIR}}
COPY --from=builder {{WORKDIR}} .
RUN npm prune --omit=dev && npm cache clean --force && chown -R node:node {{WORKDIR}}
USER node
{{ENV}}
EXPOSE {{PORT}}
ENTRYPOINT ["dumb-init", "--"]
CMD ["npm", "start"]
"#,
        ),
        template(
            "python",
            "python:3.13-slim",
            &["pip install -r requirements.txt"],
            5000,
            &["python", "app.py"],
            env(&[("PYTHONUNBUFFERED", "1")]),
            r#"FROM {{BASE_IMAGE}}
RUN apt-get update && apt-get install -y --no-install-recommends git && rm -rf /var/lib/apt/lists/*
WORKDIR {{WORKDIR}}
{{FETCH_SOURCE}}
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi
RUN useradd -m appuser && chown -R appuser:appuser {{WORKDIR}}
USER appuser
{{ENV}}
EXPOSE {{PORT}}
CMD ["sh", "-c", "if [ -f main.py ]; then exec python main.py; else exec python app.py; fi"]
"#,
        ),
        template(
            "rust",
            "rust:1.83-alpine",
            &["cargo build --release"],
            8080,
            &["./app"],
            HashMap::new(),
            r#"FROM {{BASE_IMAGE}} AS builder
RUN apk add --no-cache git musl-dev
WORKDIR {{WORKDIR}}
{{FETCH_SOURCE}}
RUN cargo build --release
RUN find target/release -maxdepth 1 -type f -perm -u+x -exec cp {} /app/app \;

FROM alpine:3.20
RUN apk add --no-cache ca-certificates && adduser -D -s /bin/sh appuser
WORKDIR {{WORKDIR}}
COPY --from=builder {{WORKDIR}}/app .
USER appuser
{{ENV}}
EXPOSE {{PORT}}
CMD ["./app"]
"#,
        ),
        template(
            "java",
            "maven:3.9-eclipse-temurin-21",
            &["mvn -q -DskipTests package"],
            8080,
            &["java", "-jar", "app.jar"],
            HashMap::new(),
            r#"FROM {{BASE_IMAGE}} AS builder
WORKDIR {{WORKDIR}}
{{FETCH_SOURCE}}
RUN if [ -f gradlew ]; then ./gradlew build -x test && cp build/libs/*.jar app.jar; \
    else mvn -q -DskipTests package && cp target/*.jar app.jar; fi

FROM eclipse-temurin:21-jre
WORKDIR {{WORKDIR}}
COPY --from=builder {{WORKDIR}}/app.jar .
{{ENV}}
EXPOSE {{PORT}}
CMD ["java", "-jar", "app.jar"]
"#,
        ),
        template(
            "php",
            "php:8.3-apache",
            &["composer install --no-dev"],
            80,
            &["apache2-foreground"],
            HashMap::new(),
            r#"FROM {{BASE_IMAGE}}
RUN apt-get update && apt-get install -y --no-install-recommends git unzip && rm -rf /var/lib/apt/lists/*
COPY --from=composer:2 /usr/bin/composer /usr/bin/composer
WORKDIR /var/www/html
{{FETCH_SOURCE}}
RUN if [ -f composer.json ]; then composer install --no-dev --no-interaction; fi
RUN sed -i 's/Listen 80/Listen {{PORT}}/' /etc/apache2/ports.conf \
    && sed -i 's/:80>/:{{PORT}}>/' /etc/apache2/sites-available/000-default.conf
{{ENV}}
EXPOSE {{PORT}}
CMD ["apache2-foreground"]
"#,
        ),
        template(
            "ruby",
            "ruby:3.3-slim",
            &["bundle install"],
            4567,
            &["bundle", "exec", "rackup"],
            env(&[("RACK_ENV", "production")]),
            r#"FROM {{BASE_IMAGE}}
RUN apt-get update && apt-get install -y --no-install-recommends git build-essential && rm -rf /var/lib/apt/lists/*
WORKDIR {{WORKDIR}}
{{FETCH_SOURCE}}
RUN if [ -f Gemfile ]; then bundle install; fi
{{ENV}}
EXPOSE {{PORT}}
CMD ["sh", "-c", "bundle exec rackup --host 0.0.0.0 --port {{PORT}}"]
"#,
        ),
        template(
            GENERIC,
            "ubuntu:22.04",
            &[],
            8080,
            &[],
            HashMap::new(),
            r#"FROM {{BASE_IMAGE}}
RUN apt-get update && apt-get install -y --no-install-recommends git ca-certificates curl \
    && rm -rf /var/lib/apt/lists/*
RUN useradd -m -s /bin/bash appuser
WORKDIR {{WORKDIR}}
{{FETCH_SOURCE}}
RUN chown -R appuser:appuser {{WORKDIR}}
USER appuser
{{ENV}}
EXPOSE {{PORT}}
CMD ["sh", "-c", "if [ -x ./start.sh ]; then exec ./start.sh; else echo 'no start command for {{APP_NAME}}'; sleep infinity; fi"]
"#,
        ),
    ]
}
